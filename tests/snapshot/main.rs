//! Integration tests for snapshot persistence.
//!
//! These tests drive complete targets through the factory and read the
//! resulting files back from disk: header integrity, block ordering, the
//! completion flag, drain under failure, direct-I/O alignment and pool
//! accounting, backpressure and end-to-end table streaming.
//!
//! Unit tests in crates/*/src cover encoding, the budget, the rate limiter
//! and the pool in isolation.

#[path = "../common/mod.rs"]
mod common;

mod backpressure;
mod direct_io;
mod failure;
mod file_format;
mod ordering;
mod streaming;
