//! Integration test entry point for burrow-node.
//!
//! Run with: cargo test --test integration -- --test-threads=1

mod harness;
mod tunnel;
