//! Flat-file endpoint support: cached CSV parsing, layout conventions and
//! structural repair

pub mod cache;
pub mod layout;
pub mod repair;
