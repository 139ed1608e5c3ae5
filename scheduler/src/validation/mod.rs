//! Validation engine.
//!
//! Each round pairs candidate validators with the nodes they receive block
//! streams from, challenges every paired node on one of its replicated
//! archives, and concludes each result by asking a referee holding the same
//! archive to derive the same seeded block sequence.

pub mod engine;
pub mod round;

pub use engine::{ValidationEngine, ValidationSettings};
pub use round::{RoundState, compare_blocks, pair_nodes};
