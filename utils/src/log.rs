// This makes it easy to import the logging stuff
//
// Callers do `use utils::log;` and then `log::debug!(...)`,
// the macros themselves come from tracing so any subscriber
// the host installs will receive them.
//
// Austin Shafer - 2020

#![allow(unused_imports)]
pub use crate::timing::PerfTimer;
pub use tracing::{debug, error, info, trace, warn, Level};
