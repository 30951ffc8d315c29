//! Integration test entry point for tessera-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod requests;
mod security;
mod transfer;
