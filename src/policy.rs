//! Leaf evaluation: where the priors and the value of a freshly reached leaf come from.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::warn;

use crate::board::GameState;
use crate::error::SearchError;
use crate::inference::InferenceScheduler;
use crate::random::{RandomGenerator, StandardRandomGenerator};

/// Below this sum of legal priors the model output is considered degenerate.
pub const PRIOR_SUM_EPSILON: f64 = 1e-8;

/// Priors over the full action space and a value in `[-1, 1]`.
///
/// The value is seen from the point of view of the player to move in the evaluated state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub priors: Vec<f64>,
    pub value: f64,
}

/// Produces an [`Evaluation`] for a non-terminal state with at least one legal move.
///
/// Selected when the search tree is built and shared by all of its worker threads.
pub trait EvaluationPolicy<S: GameState>: Send + Sync + 'static {
    fn evaluate(&self, state: &S) -> Result<Evaluation, SearchError>;
}

/// Plain MCTS: uniform priors and the result of one random game as the value.
///
/// The simulation shuffles the legal moves of the evaluated state once and plays them in that
/// order until the game ends, which fits placement games where a legal move stays legal until
/// it is played.
#[derive(Debug, Default)]
pub struct RolloutPolicy<K: RandomGenerator = StandardRandomGenerator> {
    random: Mutex<K>,
}

impl<K: RandomGenerator> RolloutPolicy<K> {
    pub fn new(random: K) -> Self {
        Self {
            random: Mutex::new(random),
        }
    }
}

impl<S: GameState, K: RandomGenerator> EvaluationPolicy<S> for RolloutPolicy<K> {
    fn evaluate(&self, state: &S) -> Result<Evaluation, SearchError> {
        let mut actions = state.get_available_moves();
        if actions.is_empty() {
            return Err(SearchError::NoLegalMoves);
        }
        let priors = vec![1.0 / actions.len() as f64; state.get_action_size()];

        self.random
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shuffle(&mut actions);

        let player = state.get_current_player();
        let mut board = state.clone();
        let mut outcome = board.get_outcome();
        for action in actions {
            board.perform_move(action);
            outcome = board.get_outcome();
            if outcome.is_terminal() {
                break;
            }
        }

        Ok(Evaluation {
            priors,
            value: outcome.value_for(&player),
        })
    }
}

/// AlphaZero-style evaluation through an [`InferenceScheduler`].
///
/// Priors are restricted to the legal moves and renormalized. When the legal mass is below
/// [`PRIOR_SUM_EPSILON`], or is not a finite number, a warning is logged and counted; the priors
/// are still divided by the sum, or replaced by a uniform distribution when the sum is not
/// positive and finite.
#[derive(Debug)]
pub struct NeuralPolicy {
    scheduler: Arc<InferenceScheduler>,
    degenerate: AtomicU64,
}

impl NeuralPolicy {
    pub fn new(scheduler: Arc<InferenceScheduler>) -> Self {
        Self {
            scheduler,
            degenerate: AtomicU64::new(0),
        }
    }

    pub fn scheduler(&self) -> &Arc<InferenceScheduler> {
        &self.scheduler
    }

    /// Number of evaluations whose legal priors summed to less than [`PRIOR_SUM_EPSILON`] or to
    /// a value that is not finite.
    pub fn degenerate_evaluations(&self) -> u64 {
        self.degenerate.load(Ordering::Relaxed)
    }
}

impl<S: GameState> EvaluationPolicy<S> for NeuralPolicy {
    fn evaluate(&self, state: &S) -> Result<Evaluation, SearchError> {
        let output = self.scheduler.submit(state)?.wait()?;
        let actions = state.get_available_moves();
        if actions.is_empty() {
            return Err(SearchError::NoLegalMoves);
        }

        let legal_prior =
            |action: usize| f64::from(output.priors.get(action).copied().unwrap_or(0.0));
        let sum: f64 = actions.iter().map(|&action| legal_prior(action)).sum();
        let usable = sum.is_finite() && sum > 0.0;
        if !usable || sum < PRIOR_SUM_EPSILON {
            self.degenerate.fetch_add(1, Ordering::Relaxed);
            warn!("model priors over {} legal moves sum to {sum:e}", actions.len());
        }

        let mut priors = vec![0.0; state.get_action_size()];
        for &action in &actions {
            if let Some(prior) = priors.get_mut(action) {
                *prior = if usable {
                    legal_prior(action) / sum
                } else {
                    1.0 / actions.len() as f64
                };
            }
        }

        Ok(Evaluation {
            priors,
            value: f64::from(output.value),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::board::GameState;
    use crate::boards::gomoku::GomokuBoard;
    use crate::error::{InferenceError, ModelError, SearchError};
    use crate::inference::{InferenceBatch, InferenceScheduler, Prediction, SchedulerConfig};
    use crate::policy::{EvaluationPolicy, NeuralPolicy, RolloutPolicy};
    use crate::random::SeededRandomGenerator;

    fn scheduler_with(priors: Vec<f32>, value: f32) -> Arc<InferenceScheduler> {
        let model = move |batch: &InferenceBatch| -> Result<Prediction, ModelError> {
            Ok(Prediction {
                priors: vec![priors.clone(); batch.rows()],
                values: vec![value; batch.rows()],
            })
        };
        let config = SchedulerConfig {
            max_batch_size: 4,
            collection_timeout: Duration::from_millis(1),
        };
        Arc::new(InferenceScheduler::new(model, config).unwrap())
    }

    fn tic_tac_toe_with(moves: &[usize]) -> GomokuBoard {
        let mut board = GomokuBoard::new(3, 3);
        for &action in moves {
            board.perform_move(action);
        }
        board
    }

    #[test]
    fn rollout_gives_uniform_priors_and_game_value() {
        // arrange
        let board = tic_tac_toe_with(&[4, 0]);
        let policy = RolloutPolicy::new(SeededRandomGenerator::new(1));

        // act
        let evaluation = policy.evaluate(&board).unwrap();

        // assert
        assert_eq!(evaluation.priors.len(), 9);
        assert!(evaluation.priors.iter().all(|&p| (p - 1.0 / 7.0).abs() < 1e-12));
        assert!([-1.0, 0.0, 1.0].contains(&evaluation.value));
    }

    #[test]
    fn rollout_is_reproducible_with_same_seed() {
        let board = GomokuBoard::new(6, 4);
        let first = RolloutPolicy::new(SeededRandomGenerator::new(99));
        let second = RolloutPolicy::new(SeededRandomGenerator::new(99));

        let a: Vec<f64> = (0..20).map(|_| first.evaluate(&board).unwrap().value).collect();
        let b: Vec<f64> = (0..20).map(|_| second.evaluate(&board).unwrap().value).collect();

        assert_eq!(a, b);
    }

    #[test]
    fn rollout_scores_forced_win_for_player_to_move() {
        // X to move with only the winning square left:
        // x o x
        // o x o
        // o x .
        let board = tic_tac_toe_with(&[0, 1, 2, 3, 4, 5, 7, 6]);
        let policy = RolloutPolicy::new(SeededRandomGenerator::default());

        for _ in 0..5 {
            assert_eq!(policy.evaluate(&board).unwrap().value, 1.0);
        }
    }

    #[test]
    fn neural_priors_are_renormalized_over_legal_moves() {
        // arrange
        let board = tic_tac_toe_with(&[0, 8]);
        let priors = vec![0.5, 0.1, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.3];
        let policy = NeuralPolicy::new(scheduler_with(priors, -0.25));

        // act
        let evaluation = EvaluationPolicy::<GomokuBoard>::evaluate(&policy, &board).unwrap();

        // assert
        assert_eq!(evaluation.priors[0], 0.0);
        assert_eq!(evaluation.priors[8], 0.0);
        assert!((evaluation.priors[1] - 0.5).abs() < 1e-6);
        assert!((evaluation.priors[2] - 0.5).abs() < 1e-6);
        assert!((evaluation.priors.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(evaluation.value, -0.25);
        assert_eq!(policy.degenerate_evaluations(), 0);
    }

    #[test]
    fn tiny_priors_warn_but_still_normalize() {
        let board = tic_tac_toe_with(&[]);
        let policy = NeuralPolicy::new(scheduler_with(vec![1e-12; 9], 0.0));

        let evaluation = EvaluationPolicy::<GomokuBoard>::evaluate(&policy, &board).unwrap();

        assert!((evaluation.priors.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert_eq!(policy.degenerate_evaluations(), 1);
    }

    #[test]
    fn zero_priors_fall_back_to_uniform() {
        let board = tic_tac_toe_with(&[4]);
        let policy = NeuralPolicy::new(scheduler_with(vec![0.0; 9], 0.0));

        let evaluation = EvaluationPolicy::<GomokuBoard>::evaluate(&policy, &board).unwrap();

        assert_eq!(evaluation.priors[4], 0.0);
        assert!(evaluation.priors.iter().all(|&p| p.is_finite()));
        assert!((evaluation.priors[0] - 1.0 / 8.0).abs() < 1e-12);
        assert_eq!(policy.degenerate_evaluations(), 1);
    }

    #[test]
    fn nan_priors_warn_and_fall_back_to_uniform() {
        let board = tic_tac_toe_with(&[]);
        let policy = NeuralPolicy::new(scheduler_with(vec![f32::NAN; 9], 0.0));

        let evaluation = EvaluationPolicy::<GomokuBoard>::evaluate(&policy, &board).unwrap();

        assert!(evaluation.priors.iter().all(|&p| (p - 1.0 / 9.0).abs() < 1e-12));
        assert_eq!(policy.degenerate_evaluations(), 1);
    }

    #[test]
    fn infinite_priors_warn_and_fall_back_to_uniform() {
        let board = tic_tac_toe_with(&[4]);
        let mut priors = vec![0.1; 9];
        priors[0] = f32::INFINITY;
        let policy = NeuralPolicy::new(scheduler_with(priors, 0.0));

        let evaluation = EvaluationPolicy::<GomokuBoard>::evaluate(&policy, &board).unwrap();

        assert!((evaluation.priors[0] - 1.0 / 8.0).abs() < 1e-12);
        assert_eq!(evaluation.priors[4], 0.0);
        assert_eq!(policy.degenerate_evaluations(), 1);
    }

    #[test]
    fn model_failure_surfaces_as_search_error() {
        let failing = |_: &InferenceBatch| -> Result<Prediction, ModelError> {
            Err(ModelError("out of memory".to_string()))
        };
        let scheduler = InferenceScheduler::new(failing, SchedulerConfig::default()).unwrap();
        let policy = NeuralPolicy::new(Arc::new(scheduler));

        let result = EvaluationPolicy::<GomokuBoard>::evaluate(&policy, &GomokuBoard::new(3, 3));

        assert_matches!(result, Err(SearchError::Inference(InferenceError::Model(_))));
    }
}
