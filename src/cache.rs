//! Credential caching, expiry decisions, and single-flight refresh coordination.

pub mod coordinator;
pub mod policy;
pub mod state;
