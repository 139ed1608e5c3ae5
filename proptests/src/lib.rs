//! Property-based tests for the carfile CDN.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all property tests
//! cargo test -p proptests
//!
//! # Run with more test cases (slower but more thorough)
//! PROPTEST_CASES=10000 cargo test -p proptests
//!
//! # Run specific test module
//! cargo test -p proptests sampling
//! ```
//!
//! ## Test Categories
//!
//! - **Index tests**: bucket placement, ordering, archive file round-trip
//! - **Sampling tests**: seed determinism, draw independence, membership
//! - **Assets tests**: summary hashes independent of insertion order
//! - **Selection tests**: node filtering and least-busy ordering
//! - **Step tests**: tier sequencing never moves backwards

// Re-export common for use in test modules
pub use common;

/// Shared test strategies and helpers.
pub mod strategies;

// Test modules
#[cfg(test)]
mod assets;
#[cfg(test)]
mod index;
#[cfg(test)]
mod sampling;
#[cfg(test)]
mod selection;
#[cfg(test)]
mod steps;
