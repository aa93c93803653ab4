//! Tollgate - Distributed Token Bucket Admission Control
//!
//! This crate grants or denies requests against per-(principal, resource)
//! quotas. Bucket state lives in a store shared by every service instance,
//! and is only ever changed through an atomic update so concurrent callers
//! cannot admit more requests than a bucket holds.

pub mod config;
pub mod error;
pub mod ratelimit;
