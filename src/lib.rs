#![no_std]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

// Must come first so the logging macros are visible in the other modules.
mod fmt;

#[cfg(feature = "async-await")]
pub(crate) mod atomic_waker;
mod bus;
pub mod hal;
mod irq;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod state;

pub use bus::{Callback, Config, Error, InitError, Rejected, RxCallback, UsartBus};
pub use state::{Fault, Status, TransferId};
