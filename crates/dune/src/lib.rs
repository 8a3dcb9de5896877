//! Dune Analytics implementation of the gateway's remote query boundary.

pub mod client;
mod wire;

pub use client::{DuneClient, DuneClientConfig, RetryPolicy};
