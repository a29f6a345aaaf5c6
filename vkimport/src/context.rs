// The device that is current on this thread
//
// Some callers can't pass a device around, so one can be made current
// for a scope. The slot is per thread, never process wide.
//
// Austin Shafer - 2021
use crate::device::Device;

use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static CURRENT_DEVICE: RefCell<Option<Rc<Device>>> = RefCell::new(None);
}

/// Keeps a device current until dropped
///
/// Dropping the guard restores whatever was current before, so guards
/// nest.
#[must_use = "the device stops being current when the guard is dropped"]
pub struct CurrentGuard {
    cg_prev: Option<Rc<Device>>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.cg_prev.take();
        CURRENT_DEVICE.with(|cur| *cur.borrow_mut() = prev);
    }
}

/// The device made current on this thread, if any
pub fn current_device() -> Option<Rc<Device>> {
    CURRENT_DEVICE.with(|cur| cur.borrow().clone())
}

impl Device {
    pub fn make_current(self: &Rc<Self>) -> CurrentGuard {
        let prev = CURRENT_DEVICE.with(|cur| cur.borrow_mut().replace(self.clone()));
        CurrentGuard { cg_prev: prev }
    }

    pub fn is_current(self: &Rc<Self>) -> bool {
        CURRENT_DEVICE.with(|cur| match cur.borrow().as_ref() {
            Some(d) => Rc::ptr_eq(d, self),
            None => false,
        })
    }
}
