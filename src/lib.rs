//! Gatekeeper - Distributed Sliding-Window Rate Limiting
//!
//! This crate implements a sliding-window-log rate limiter whose counters
//! live in a shared counting store (Redis in production, an in-process store
//! for tests and single-node use). Any number of limiter instances pointing
//! at the same store agree on every decision. Store outages fail open.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
