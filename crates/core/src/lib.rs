//! Switchyard core: the audio routing policy engine
//!
//! Everything here is synchronous and single-owner; the async host lives in
//! `switchyard-infra`.

pub mod domain;

pub use domain::*;
