//! Single-flight memoization of build-step calls for the Strata engine
//!
//! This crate provides the in-process half of Strata's build caching:
//! - Deduplication of concurrent calls for the same cache key
//! - Reference-counted retention of completed results
//! - Waiter-counted cancellation of computations nobody is waiting on
//! - Fail-fast detection of self-referential (deadlocking) calls
//!
//! # Overview
//!
//! The solver asks [`Cache::get_or_initialize`] for the result of a keyed
//! call. If the key is settled, the caller gets the stored result and a new
//! reference. If a computation is in flight, the caller joins it as a waiter.
//! Otherwise a new computation is spawned against a derived [`CallContext`]
//! whose cancellation fires only when *every* waiter has lost interest.
//!
//! Results must be released exactly once per successful call; an entry is
//! dropped from the index when its reference and waiter counts both reach
//! zero.

mod calls;
mod context;
mod error;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use calls::{
    Cache, CacheResult, CallbackFuture, OnReleaseFn, PostCallFn, ValueWithCallbacks,
};
pub use context::CallContext;
