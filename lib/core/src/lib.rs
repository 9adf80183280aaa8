//! Core identifiers and utilities shared by the chorus crates.
//!
//! Chat platforms hand us opaque group and member identifiers; this crate
//! wraps them in distinct types so they cannot be swapped by accident, and
//! provides the `Result` alias every layer uses for rootcause reports.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{GroupId, MemberId, ParseIdError, TurnId};
