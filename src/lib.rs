//! Floodgate - Admission Control Engine
//!
//! This crate decides whether a request may proceed based on rate limit
//! policies. Policies are resolved per client, route and method; their rates
//! are counted atomically in a shared store by one of several window
//! algorithms, and a circuit breaker keeps requests flowing when the store is
//! unhealthy.

pub mod algorithm;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
