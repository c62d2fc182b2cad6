//! Switchyard infrastructure: hardware clients and the async policy host

pub mod hal;
pub mod service;

pub use hal::{HalCall, RecordingHal};
pub use service::{PolicyService, SettleMode};
