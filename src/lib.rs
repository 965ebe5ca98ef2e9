//! Ratewarden - Shared-State Rate Limiting
//!
//! This crate decides whether a client request may proceed using one of four
//! interchangeable algorithms (fixed window, sliding window, token bucket,
//! concurrency slots). Every algorithm keeps its state in a shared counter
//! store, so any number of process instances enforce one limit together.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod retry;
pub mod service;
pub mod store;
