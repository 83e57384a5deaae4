//! Ready-made implementations of the `GameState` trait.

/// A `GameState` implementation for Gomoku (n×n, k in a row).
pub mod gomoku;
