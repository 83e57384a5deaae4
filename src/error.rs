use std::io;

use thiserror::Error;

/// Errors produced by the [`WorkerPool`](crate::worker_pool::WorkerPool).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is already shut down")]
    AlreadyShutdown,
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    #[error("task result channel disconnected")]
    Disconnected,
}

/// Failure reported by an opaque [`Model`](crate::inference::Model).
#[derive(Debug, Clone, Error)]
#[error("model prediction failed: {0}")]
pub struct ModelError(pub String);

/// Errors produced by the [`InferenceScheduler`](crate::inference::InferenceScheduler).
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference scheduler is already shut down")]
    AlreadyShutdown,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("inference result channel disconnected")]
    Disconnected,
    #[error("failed to spawn batcher thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Errors surfaced by the [`SearchTree`](crate::mcts::SearchTree).
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("no legal moves at the root")]
    NoLegalMoves,
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
