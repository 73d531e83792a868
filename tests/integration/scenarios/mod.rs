//! Test scenarios for integration testing
//!
//! - ordering: pipelined replies come back in request order
//! - multikey: mget/mset fan-out and merge
//! - failure: backend failures become single error replies
//! - pool: unit pool bounds under concurrency

pub mod failure;
pub mod multikey;
pub mod pool;
