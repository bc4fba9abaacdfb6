//! HTTP metadata source and its retry helpers.

pub mod client;
pub mod retry;
