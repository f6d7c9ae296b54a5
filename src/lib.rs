//! Application cache for web farms: dependency-touch invalidation, a persistent
//! disk tier and cross-node synchronization.

pub mod cache;
pub mod config;
pub mod infra;
