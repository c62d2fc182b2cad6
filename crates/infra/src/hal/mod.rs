//! Hardware client implementations
//!
//! The policy talks to hardware through [`HalClient`]. The recording client
//! here accepts every request, keeps a log of what it was asked to do and can
//! be scripted to fail or to report capabilities, which makes it the backend
//! of the CLI simulator and of the integration tests.
//!
//! [`HalClient`]: switchyard_core::domain::hal::HalClient

pub mod recording;

pub use recording::*;
