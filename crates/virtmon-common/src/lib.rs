//! Shared value types for the virtmon alert evaluation engine.
//!
//! Everything here is a plain, owned value: guests and rules embedded in an
//! [`types::Alert`] are snapshots taken at creation time and never share
//! references with externally mutable state.

pub mod id;
pub mod types;
