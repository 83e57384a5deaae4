//! Micro-batching of single-state evaluation requests.
//!
//! Many playouts ask for one evaluation each. The [`InferenceScheduler`] queues those requests
//! and a background thread groups them, calls the [`Model`] once per group, and routes each
//! row of the output back to the request it belongs to.
//!
//! A batch is flushed when either:
//! - it holds `max_batch_size` requests, or
//! - waiting for the next request timed out and at least one request is pending.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

use crate::board::GameState;
use crate::error::{InferenceError, ModelError, panic_message};

/// Encoded states concatenated row by row into one flat input.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceBatch {
    data: Vec<f32>,
    rows: usize,
    row_len: usize,
}

impl InferenceBatch {
    /// Number of encoded states in the batch.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Length of one encoded state.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// The flat `rows * row_len` input.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// The encoded state at `index`. Panics if `index >= rows()`.
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.row_len..(index + 1) * self.row_len]
    }
}

/// Output of one model call: one prior vector and one value per input row.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub priors: Vec<Vec<f32>>,
    pub values: Vec<f32>,
}

/// The opaque prediction function.
///
/// `priors` are probabilities over the full action space, `values` are in `[-1, 1]` from the
/// point of view of the player to move in each encoded state. Calls are synchronous and
/// independent of each other.
pub trait Model: Send + Sync + 'static {
    fn predict(&self, batch: &InferenceBatch) -> Result<Prediction, ModelError>;
}

impl<F> Model for F
where
    F: Fn(&InferenceBatch) -> Result<Prediction, ModelError> + Send + Sync + 'static,
{
    fn predict(&self, batch: &InferenceBatch) -> Result<Prediction, ModelError> {
        self(batch)
    }
}

/// The model output for a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub priors: Vec<f32>,
    pub value: f32,
}

/// Batching parameters of an [`InferenceScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on the number of requests passed to one `predict` call.
    pub max_batch_size: usize,
    /// How long the batcher waits for each additional request before flushing.
    pub collection_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            collection_timeout: Duration::from_millis(1),
        }
    }
}

/// Counters of the work done by an [`InferenceScheduler`] so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Number of `predict` calls made.
    pub batches: u64,
    /// Number of requests passed to `predict`.
    pub requests: u64,
}

struct Request {
    features: Vec<f32>,
    tx: mpsc::Sender<Result<ModelOutput, InferenceError>>,
}

/// Resolves to the model output for one submitted state.
#[derive(Debug)]
pub struct InferenceHandle {
    rx: mpsc::Receiver<Result<ModelOutput, InferenceError>>,
}

impl InferenceHandle {
    /// Blocks until the batch holding this request has been evaluated.
    pub fn wait(self) -> Result<ModelOutput, InferenceError> {
        match self.rx.recv() {
            Ok(r) => r,
            Err(_) => Err(InferenceError::Disconnected),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    max_batch_size: AtomicUsize,
    batches: AtomicU64,
    requests: AtomicU64,
}

/// Producer/consumer batcher in front of a [`Model`].
#[derive(Debug)]
pub struct InferenceScheduler {
    sender: RwLock<Option<mpsc::Sender<Request>>>,
    batcher: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl InferenceScheduler {
    /// Starts the background batcher thread for `model`.
    pub fn new<M: Model>(model: M, config: SchedulerConfig) -> Result<Self, InferenceError> {
        let shared = Arc::new(Shared {
            max_batch_size: AtomicUsize::new(config.max_batch_size.max(1)),
            ..Shared::default()
        });
        let (sender, receiver) = mpsc::channel::<Request>();

        let shared_b = Arc::clone(&shared);
        let timeout = config.collection_timeout;
        let batcher = thread::Builder::new()
            .name("mcts-inference".to_string())
            .spawn(move || batcher_loop(&model, &receiver, timeout, &shared_b))?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            batcher: Mutex::new(Some(batcher)),
            shared,
        })
    }

    /// Encodes `state` and queues it for evaluation.
    pub fn submit<S: GameState>(&self, state: &S) -> Result<InferenceHandle, InferenceError> {
        self.submit_encoded(state.encode())
    }

    /// Queues an already encoded state for evaluation.
    pub fn submit_encoded(&self, features: Vec<f32>) -> Result<InferenceHandle, InferenceError> {
        let (tx, rx) = mpsc::channel();
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        sender
            .as_ref()
            .ok_or(InferenceError::AlreadyShutdown)?
            .send(Request { features, tx })
            .map_err(|_| InferenceError::AlreadyShutdown)?;
        Ok(InferenceHandle { rx })
    }

    /// Changes the batch-size ceiling used for batches collected from now on.
    pub fn set_max_batch_size(&self, max_batch_size: usize) {
        self.shared
            .max_batch_size
            .store(max_batch_size.max(1), Ordering::Relaxed);
    }

    /// A snapshot of the batch and request counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            batches: self.shared.batches.load(Ordering::Relaxed),
            requests: self.shared.requests.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting requests, evaluates everything already queued, and joins the batcher.
    pub fn shutdown(&self) {
        drop(
            self.sender
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let batcher = self
            .batcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(batcher) = batcher {
            if batcher.join().is_err() {
                error!("inference batcher thread panicked");
            }
            debug!("inference scheduler stopped");
        }
    }
}

impl Drop for InferenceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn batcher_loop(
    model: &dyn Model,
    receiver: &mpsc::Receiver<Request>,
    timeout: Duration,
    shared: &Shared,
) {
    // Idle until the first request of a batch arrives.
    while let Ok(first) = receiver.recv() {
        let max_batch_size = shared.max_batch_size.load(Ordering::Relaxed);
        let (requests, disconnected) = collect_batch(receiver, first, timeout, max_batch_size);
        run_batch(model, requests, shared);
        if disconnected {
            break;
        }
    }
}

/// Adds up to `max_batch_size - 1` requests to `first`, waiting at most `timeout` for each.
///
/// The flag is set once every producer is gone and the queue is empty.
fn collect_batch(
    receiver: &mpsc::Receiver<Request>,
    first: Request,
    timeout: Duration,
    max_batch_size: usize,
) -> (Vec<Request>, bool) {
    let mut requests = vec![first];
    while requests.len() < max_batch_size {
        match receiver.recv_timeout(timeout) {
            Ok(request) => requests.push(request),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => return (requests, true),
        }
    }
    (requests, false)
}

fn run_batch(model: &dyn Model, requests: Vec<Request>, shared: &Shared) {
    let row_len = requests[0].features.len();
    let (requests, malformed): (Vec<_>, Vec<_>) = requests
        .into_iter()
        .partition(|request| request.features.len() == row_len);
    for request in malformed {
        let actual = request.features.len();
        let _ = request.tx.send(Err(InferenceError::ShapeMismatch {
            expected: row_len,
            actual,
        }));
    }

    let rows = requests.len();
    let mut data = Vec::with_capacity(rows * row_len);
    for request in &requests {
        data.extend_from_slice(&request.features);
    }
    let batch = InferenceBatch {
        data,
        rows,
        row_len,
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| model.predict(&batch)));
    shared.batches.fetch_add(1, Ordering::Relaxed);
    shared.requests.fetch_add(rows as u64, Ordering::Relaxed);
    debug!("evaluated inference batch of {rows} rows");

    let prediction = match outcome {
        Ok(Ok(prediction)) => prediction,
        Ok(Err(e)) => return fail_all(requests, || InferenceError::Model(e.clone())),
        Err(payload) => {
            let message = panic_message(&*payload);
            error!("model panicked during predict: {message}");
            return fail_all(requests, || {
                InferenceError::Model(ModelError(message.clone()))
            });
        }
    };

    let returned = prediction.priors.len().min(prediction.values.len());
    if prediction.priors.len() != rows || prediction.values.len() != rows {
        return fail_all(requests, || InferenceError::ShapeMismatch {
            expected: rows,
            actual: returned,
        });
    }

    for ((request, priors), value) in requests
        .into_iter()
        .zip(prediction.priors)
        .zip(prediction.values)
    {
        let _ = request.tx.send(Ok(ModelOutput { priors, value }));
    }
}

fn fail_all(requests: Vec<Request>, error: impl Fn() -> InferenceError) {
    for request in requests {
        let _ = request.tx.send(Err(error()));
    }
}
