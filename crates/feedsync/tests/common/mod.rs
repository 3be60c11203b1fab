//! Shared test utilities for feedsync integration tests.
//!
//! - `fakes`: fetcher, store, oracle and notifier doubles
//! - `harness`: `TestEnv`, an in-memory instance of the whole job stack

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::*;
