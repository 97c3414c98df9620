#![forbid(unsafe_code)]

//! Public entry point for the minitube crate.
//!
//! The `backend` binary wires these modules together; they are exposed here so
//! the stores and the router can be exercised directly.

pub mod api;
pub mod config;
pub mod error;
pub mod guard;
pub mod json_store;
pub mod media;
pub mod metadata;
pub mod urls;
