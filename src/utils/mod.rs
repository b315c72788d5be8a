//! Shared helpers for binaries and broker plumbing.

pub mod backoff;
pub mod bootstrap;
