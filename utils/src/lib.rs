// A set of helper structs for common operations
//
// Austin Shafer - 2020
pub mod timing;
pub mod log;
pub mod region;

/// Round `val` up to the next multiple of `align`
///
/// `align` must be a power of two. This is used for the row
/// pitch of buffers handed to the gpu, which commonly need
/// their stride to land on a 16 byte boundary.
pub fn align_up(val: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}
