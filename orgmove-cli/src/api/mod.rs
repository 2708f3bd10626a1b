//! HTTP access to an org's data API

pub mod client;

pub use client::{BatchResult, OrgClient};
