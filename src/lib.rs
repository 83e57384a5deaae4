//! Parallel Monte Carlo tree search for two-player, zero-sum, turn-based games.
//!
//! Many worker threads run playouts concurrently on one shared tree. Virtual loss steers them
//! apart, and every leaf is expanded exactly once. Leaves are evaluated either by random
//! rollouts (plain MCTS) or by a batched neural network model (AlphaZero style), whose
//! single-state requests are grouped into batches by an [`inference::InferenceScheduler`].
//!
//! # Example
//!
//! ```rust
//! use parallel_mcts::board::GameState;
//! use parallel_mcts::boards::gomoku::GomokuBoard;
//! use parallel_mcts::mcts::SearchTree;
//! use parallel_mcts::policy::RolloutPolicy;
//! use parallel_mcts::random::SeededRandomGenerator;
//!
//! // Create a 6x6 board where four in a row wins
//! let mut board = GomokuBoard::new(6, 4);
//!
//! // Create and configure a new search tree using the builder
//! let mut search: SearchTree<GomokuBoard, _> =
//!     SearchTree::builder(RolloutPolicy::new(SeededRandomGenerator::default()))
//!         .with_workers(4)
//!         .with_playouts(400)
//!         .build();
//!
//! // Search and pick the most visited move
//! let action = search.choose_action(&board)?;
//! println!("The best move is: {action}");
//!
//! // Advance the game and keep the matching subtree
//! board.perform_move(action);
//! search.update_with_move(action);
//! # Ok::<(), parallel_mcts::error::SearchError>(())
//! ```

/// Contains the `GameState` trait and the `GameOutcome` enum that define the interface for a game.
pub mod board;
/// Contains pre-made implementations of the `GameState` trait.
pub mod boards;
/// Error types returned by the pool, the scheduler and the search.
pub mod error;
/// Micro-batching of model evaluations behind the `InferenceScheduler`.
pub mod inference;
/// The core module of the library, containing the `SearchTree` implementation.
pub mod mcts;
/// Contains the `MctsNode` struct, which represents a node in the search tree.
pub mod mcts_node;
/// Leaf evaluation policies: random rollouts and neural network inference.
pub mod policy;
/// Contains traits and implementations for random number generation.
pub mod random;
/// Contains the `WorkerPool` running playouts in parallel.
pub mod worker_pool;
