//! Gantry - get step execution core for pipeline builds
//!
//! Fetches a resource version onto a worker, reusing a fingerprint-keyed
//! cache volume when one is warm, and publishes the result for later steps.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod exec;
pub mod resource;
pub mod worker;

pub use error::{GantryError, GantryResult};
