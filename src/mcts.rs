use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;

use crate::board::GameState;
use crate::error::SearchError;
use crate::mcts_node::MctsNode;
use crate::policy::EvaluationPolicy;
use crate::random::RandomGenerator;
use crate::worker_pool::WorkerPool;

/// Temperatures below this value select the most visited action deterministically.
pub const TEMPERATURE_EPSILON: f64 = 1e-3;

/// Search parameters fixed when the tree is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    /// Number of worker threads running playouts.
    pub workers: usize,
    /// Root visit count each move decision searches up to.
    pub playouts: u32,
    /// Weight of the exploration term in the selection formula.
    pub c_puct: f64,
    /// Penalty per in-flight thread below a node during selection.
    pub c_virtual_loss: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            playouts: 1600,
            c_puct: 5.0,
            c_virtual_loss: 3.0,
        }
    }
}

/// Visit statistics of one child of the root.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildStats {
    pub action: usize,
    pub visits: u32,
    pub mean_value: f64,
    pub prior: f64,
}

/// The main struct for running a parallel Monte Carlo Tree Search.
///
/// It owns the search tree, the worker threads and the evaluation policy. Playouts of one
/// search run concurrently on the shared tree; the tree is carried over between moves through
/// [`update_with_move`](SearchTree::update_with_move).
pub struct SearchTree<S: GameState, P: EvaluationPolicy<S>> {
    root: Arc<MctsNode>,
    policy: Arc<P>,
    pool: WorkerPool,
    config: SearchConfig,
    _state: PhantomData<fn() -> S>,
}

/// A builder for creating instances of `SearchTree`.
pub struct SearchTreeBuilder<S: GameState, P: EvaluationPolicy<S>> {
    policy: P,
    config: SearchConfig,
    _state: PhantomData<fn() -> S>,
}

impl<S: GameState, P: EvaluationPolicy<S>> SearchTreeBuilder<S, P> {
    /// Creates a new builder with the default configuration.
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            config: SearchConfig::default(),
            _state: PhantomData,
        }
    }

    /// Sets the number of worker threads running playouts.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Sets the root visit count `choose_action` searches up to.
    pub fn with_playouts(mut self, playouts: u32) -> Self {
        self.config.playouts = playouts;
        self
    }

    /// Sets the weight of the exploration term.
    pub fn with_c_puct(mut self, c_puct: f64) -> Self {
        self.config.c_puct = c_puct;
        self
    }

    /// Sets the penalty per in-flight thread below a node.
    pub fn with_virtual_loss(mut self, c_virtual_loss: f64) -> Self {
        self.config.c_virtual_loss = c_virtual_loss;
        self
    }

    /// Replaces every parameter at once.
    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the worker threads and builds the `SearchTree`.
    pub fn build(self) -> SearchTree<S, P> {
        SearchTree::new(self.policy, self.config)
    }
}

impl<S: GameState, P: EvaluationPolicy<S>> SearchTree<S, P> {
    /// Returns a new builder for `SearchTree`.
    pub fn builder(policy: P) -> SearchTreeBuilder<S, P> {
        SearchTreeBuilder::new(policy)
    }

    /// Creates a new `SearchTree` with an empty root.
    ///
    /// It is recommended to use the builder pattern via `SearchTree::builder()` instead.
    pub fn new(policy: P, config: SearchConfig) -> Self {
        Self {
            root: MctsNode::new_root(),
            policy: Arc::new(policy),
            pool: WorkerPool::new(config.workers),
            config,
            _state: PhantomData,
        }
    }

    /// Returns the current root of the search tree.
    pub fn get_root(&self) -> &Arc<MctsNode> {
        &self.root
    }

    /// Returns the policy evaluating leaves.
    pub fn get_policy(&self) -> &P {
        &self.policy
    }

    /// Returns the parameters the tree was built with.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Number of playouts that went through the current root.
    pub fn root_visits(&self) -> u32 {
        self.root.visits()
    }

    /// Runs a single playout from `state` on the calling thread.
    ///
    /// `state` must be the position the root stands for.
    pub fn playout(&self, state: S) -> Result<(), SearchError> {
        playout(
            &self.root,
            state,
            self.policy.as_ref(),
            self.config.c_puct,
            self.config.c_virtual_loss,
        )
    }

    /// Runs playouts in parallel until the root has been visited `target` times.
    ///
    /// Visits left from earlier searches on the same root count towards the target. Returns
    /// the number of playouts executed. If any playout fails, the first error is returned
    /// once all of them have finished.
    pub fn run(&self, state: &S, target: u32) -> Result<u32, SearchError> {
        let needed = target.saturating_sub(self.root.visits());
        if needed == 0 {
            return Ok(0);
        }

        let (c_puct, c_virtual_loss) = (self.config.c_puct, self.config.c_virtual_loss);
        let handles = (0..needed)
            .map(|_| {
                let root = Arc::clone(&self.root);
                let policy = Arc::clone(&self.policy);
                let state = state.clone();
                self.pool.submit(move || {
                    playout(&root, state, policy.as_ref(), c_puct, c_virtual_loss)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.wait().map_err(SearchError::from).and_then(|r| r) {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        debug!(
            "ran {needed} playouts on {} workers, root visits {}",
            self.pool.workers(),
            self.root.visits()
        );
        Ok(needed)
    }

    /// Searches `state` and returns the most visited action.
    pub fn choose_action(&self, state: &S) -> Result<usize, SearchError> {
        self.run(state, self.config.playouts)?;
        self.best_action().ok_or(SearchError::NoLegalMoves)
    }

    /// The most visited child of the root, ties going to the first child. No search is run.
    pub fn best_action(&self) -> Option<usize> {
        let mut best: Option<&Arc<MctsNode>> = None;
        for child in self.root.children() {
            if best.is_none_or(|b| child.visits() > b.visits()) {
                best = Some(child);
            }
        }
        best.and_then(|child| child.action())
    }

    /// Searches `state` and converts root visit counts into a distribution over the action
    /// space.
    ///
    /// Each legal action gets a weight of `visits^(1/temperature)`; illegal actions get `0`.
    /// A temperature below [`TEMPERATURE_EPSILON`] gives a one-hot distribution on the most
    /// visited action.
    pub fn action_probabilities(
        &self,
        state: &S,
        temperature: f64,
    ) -> Result<Vec<f64>, SearchError> {
        self.run(state, self.config.playouts)?;
        let best = self.best_action().ok_or(SearchError::NoLegalMoves)?;
        let children = self.root.children();
        let mut probs = vec![0.0; state.get_action_size()];

        let max_visits = children.iter().map(|child| child.visits()).max().unwrap_or(0);
        if temperature < TEMPERATURE_EPSILON || max_visits == 0 {
            if let Some(p) = probs.get_mut(best) {
                *p = 1.0;
            }
            return Ok(probs);
        }

        // Scaled by the largest count so that small temperatures do not overflow.
        let max_ln = f64::from(max_visits).ln();
        let mut total = 0.0;
        for child in children {
            let Some(action) = child.action() else {
                continue;
            };
            let visits = child.visits();
            let weight = if visits == 0 {
                0.0
            } else {
                ((f64::from(visits).ln() - max_ln) / temperature).exp()
            };
            if let Some(p) = probs.get_mut(action) {
                *p = weight;
                total += weight;
            }
        }
        for p in &mut probs {
            *p /= total;
        }
        Ok(probs)
    }

    /// Searches `state` and samples an action from
    /// [`action_probabilities`](SearchTree::action_probabilities).
    pub fn sample_action<K: RandomGenerator>(
        &self,
        state: &S,
        temperature: f64,
        random: &mut K,
    ) -> Result<usize, SearchError> {
        let probs = self.action_probabilities(state, temperature)?;
        let mut remaining = random.next_f64();
        let mut fallback = None;
        for (action, &p) in probs.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            if remaining < p {
                return Ok(action);
            }
            remaining -= p;
            fallback = Some(action);
        }
        fallback.ok_or(SearchError::NoLegalMoves)
    }

    /// Moves the root to the child reached by `action`, keeping its statistics.
    ///
    /// Siblings of that child are dropped. If the child was never expanded, the whole tree is
    /// discarded and a fresh root takes its place.
    pub fn update_with_move(&mut self, action: usize) {
        let promoted = self
            .root
            .children()
            .iter()
            .find(|child| child.action() == Some(action))
            .cloned();

        match promoted {
            Some(child) => {
                child.detach();
                debug!("reusing subtree of action {action} with {} visits", child.visits());
                self.root = child;
            }
            None => {
                debug!("action {action} not in tree, starting from a fresh root");
                self.root = MctsNode::new_root();
            }
        }
    }

    /// Per-child statistics of the root, in expansion order.
    pub fn root_stats(&self) -> Vec<ChildStats> {
        self.root
            .children()
            .iter()
            .filter_map(|child| {
                Some(ChildStats {
                    action: child.action()?,
                    visits: child.visits(),
                    mean_value: child.mean_value(),
                    prior: child.prior(),
                })
            })
            .collect()
    }
}

/// One descent-evaluate-backup cycle from `root`, which must stand for `state`.
///
/// If the evaluation fails, the virtual loss added on the way down is removed again and no
/// visit is recorded.
fn playout<S: GameState, P: EvaluationPolicy<S> + ?Sized>(
    root: &Arc<MctsNode>,
    mut state: S,
    policy: &P,
    c_puct: f64,
    c_virtual_loss: f64,
) -> Result<(), SearchError> {
    let mut node = Arc::clone(root);
    while !node.is_leaf() {
        let Some(child) = node.select(c_puct, c_virtual_loss) else {
            break;
        };
        if let Some(action) = child.action() {
            state.perform_move(action);
        }
        node = child;
    }

    let outcome = state.get_outcome();
    let value = if outcome.is_terminal() {
        outcome.value_for(&state.get_current_player())
    } else {
        let evaluation = match policy.evaluate(&state) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                node.revert_virtual_loss();
                return Err(e);
            }
        };
        node.expand(&evaluation.priors, &state.get_available_moves());
        evaluation.value
    };

    // Node statistics are kept from the point of view of the player who moved into the node.
    node.backup(-value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use crate::board::GameState;
    use crate::boards::gomoku::GomokuBoard;
    use crate::error::{InferenceError, SearchError};
    use crate::mcts::{SearchConfig, SearchTree};
    use crate::mcts_node::MctsNode;
    use crate::policy::{Evaluation, EvaluationPolicy, RolloutPolicy};
    use crate::random::{SeededRandomGenerator, StandardRandomGenerator};

    type RolloutTree = SearchTree<GomokuBoard, RolloutPolicy<SeededRandomGenerator>>;

    fn rollout_tree(workers: usize, playouts: u32) -> RolloutTree {
        SearchTree::builder(RolloutPolicy::new(SeededRandomGenerator::new(2333)))
            .with_workers(workers)
            .with_playouts(playouts)
            .build()
    }

    fn board_with(size: usize, n_in_row: usize, moves: &[usize]) -> GomokuBoard {
        let mut board = GomokuBoard::new(size, n_in_row);
        for &action in moves {
            board.perform_move(action);
        }
        board
    }

    fn for_each_node(node: &Arc<MctsNode>, f: &mut impl FnMut(&Arc<MctsNode>)) {
        f(node);
        for child in node.children() {
            for_each_node(child, f);
        }
    }

    struct FailingPolicy;

    impl EvaluationPolicy<GomokuBoard> for FailingPolicy {
        fn evaluate(&self, _state: &GomokuBoard) -> Result<Evaluation, SearchError> {
            Err(SearchError::Inference(InferenceError::Disconnected))
        }
    }

    #[test]
    fn builder_sets_config() {
        let search = rollout_tree(3, 77);
        assert_eq!(
            search.config(),
            &SearchConfig {
                workers: 3,
                playouts: 77,
                ..SearchConfig::default()
            }
        );
    }

    #[test]
    fn playout_count_is_independent_of_worker_count() {
        for workers in [1, 2, 8] {
            // arrange
            let search = rollout_tree(workers, 300);
            let board = GomokuBoard::new(5, 4);

            // act
            let executed = search.run(&board, 300).unwrap();

            // assert
            assert_eq!(executed, 300);
            assert_eq!(search.root_visits(), 300);
            // Threads racing on the first expansion all back up at the root.
            let child_visits: u32 = search.root_stats().iter().map(|s| s.visits).sum();
            assert!(child_visits > 0 && child_visits <= 299);
        }
    }

    #[test]
    fn run_reuses_existing_visits() {
        let search = rollout_tree(2, 100);
        let board = GomokuBoard::new(4, 3);

        assert_eq!(search.run(&board, 100).unwrap(), 100);
        assert_eq!(search.run(&board, 100).unwrap(), 0);
        assert_eq!(search.run(&board, 50).unwrap(), 0);
        assert_eq!(search.run(&board, 150).unwrap(), 50);
        assert_eq!(search.root_visits(), 150);
    }

    #[test]
    fn virtual_loss_is_released_after_search() {
        let search = rollout_tree(8, 500);
        search.run(&GomokuBoard::new(5, 4), 500).unwrap();

        let mut nodes = 0;
        for_each_node(search.get_root(), &mut |node| {
            nodes += 1;
            assert_eq!(node.virtual_loss(), 0);
        });
        assert!(nodes > 25);
    }

    #[test]
    fn single_playout_on_calling_thread() {
        let search = rollout_tree(1, 10);
        let board = GomokuBoard::new(3, 3);

        search.playout(board.clone()).unwrap();
        search.playout(board).unwrap();

        assert_eq!(search.root_visits(), 2);
        assert_eq!(search.root_stats().len(), 9);
    }

    #[test]
    fn choose_action_is_deterministic_without_new_playouts() {
        let search = rollout_tree(4, 400);
        let board = GomokuBoard::new(3, 3);

        let first = search.choose_action(&board).unwrap();
        let second = search.choose_action(&board).unwrap();

        assert_eq!(first, second);
        assert_eq!(search.best_action(), Some(first));
        assert_eq!(search.root_visits(), 400);
    }

    #[test]
    fn probabilities_cover_only_legal_moves() {
        // arrange
        let board = board_with(3, 3, &[4, 0]);
        let search = rollout_tree(2, 300);

        // act
        let probs = search.action_probabilities(&board, 1.0).unwrap();

        // assert
        assert_eq!(probs.len(), 9);
        assert_eq!(probs[0], 0.0);
        assert_eq!(probs[4], 0.0);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        let stats = search.root_stats();
        let total: u32 = stats.iter().map(|s| s.visits).sum();
        for s in &stats {
            assert!((probs[s.action] - f64::from(s.visits) / f64::from(total)).abs() < 1e-9);
        }
    }

    #[test]
    fn temperature_raises_visits_to_inverse_power() {
        // arrange
        let board = board_with(3, 3, &[4]);
        let search = rollout_tree(2, 300);

        // act
        let probs = search.action_probabilities(&board, 0.5).unwrap();

        // assert
        let stats = search.root_stats();
        let total: f64 = stats.iter().map(|s| f64::from(s.visits).powi(2)).sum();
        for s in &stats {
            let expected = f64::from(s.visits).powi(2) / total;
            assert!((probs[s.action] - expected).abs() < 1e-9);
        }
        assert_eq!(probs[4], 0.0);
    }

    #[test]
    fn zero_temperature_is_one_hot_on_best_action() {
        let board = board_with(3, 3, &[4]);
        let search = rollout_tree(2, 200);

        let probs = search.action_probabilities(&board, 0.0).unwrap();
        let best = search.best_action().unwrap();

        assert_eq!(probs[best], 1.0);
        assert_eq!(probs.iter().filter(|&&p| p > 0.0).count(), 1);
    }

    #[test]
    fn small_temperature_does_not_overflow() {
        let search = rollout_tree(2, 300);
        let probs = search.action_probabilities(&GomokuBoard::new(3, 3), 0.01).unwrap();
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sample_action_returns_legal_move() {
        let board = board_with(3, 3, &[4, 0, 8]);
        let search = rollout_tree(2, 200);
        let mut random = SeededRandomGenerator::new(5);

        for _ in 0..10 {
            let action = search.sample_action(&board, 1.0, &mut random).unwrap();
            assert!(board.is_legal(action));
        }
    }

    #[test]
    fn update_with_move_keeps_chosen_subtree() {
        // arrange
        let board = GomokuBoard::new(4, 3);
        let mut search = rollout_tree(4, 400);
        search.run(&board, 400).unwrap();
        let action = search.best_action().unwrap();
        let chosen = search
            .get_root()
            .children()
            .iter()
            .find(|child| child.action() == Some(action))
            .map(Arc::clone)
            .unwrap();
        let expected_visits = chosen.visits();
        let siblings: Vec<_> = search
            .get_root()
            .children()
            .iter()
            .filter(|child| child.action() != Some(action))
            .map(Arc::downgrade)
            .collect();
        drop(chosen);

        // act
        search.update_with_move(action);

        // assert
        assert_eq!(search.root_visits(), expected_visits);
        assert!(search.get_root().parent().is_none());
        assert!(siblings.iter().all(|sibling| sibling.upgrade().is_none()));
    }

    #[test]
    fn update_with_unknown_move_starts_fresh() {
        let mut search = rollout_tree(1, 10);
        search.run(&GomokuBoard::new(3, 3), 10).unwrap();

        search.update_with_move(42);

        assert_eq!(search.root_visits(), 0);
        assert!(search.get_root().is_leaf());
        assert_eq!(search.get_root().action(), None);
    }

    #[test]
    fn reused_tree_continues_search() {
        let mut board = GomokuBoard::new(4, 3);
        let mut search = rollout_tree(2, 200);

        let action = search.choose_action(&board).unwrap();
        board.perform_move(action);
        search.update_with_move(action);
        let carried = search.root_visits();
        let executed = search.run(&board, 200).unwrap();

        assert_eq!(executed, 200 - carried);
        assert_eq!(search.root_visits(), 200);
    }

    #[test]
    fn terminal_root_has_no_action() {
        // x x x
        // o o .
        // . . .
        let board = board_with(3, 3, &[0, 3, 1, 4, 2]);
        let search = rollout_tree(2, 20);

        assert_matches!(search.choose_action(&board), Err(SearchError::NoLegalMoves));
        assert_eq!(search.root_visits(), 20);
    }

    #[test]
    fn failed_evaluation_is_reported_and_leaves_no_trace() {
        let search: SearchTree<GomokuBoard, FailingPolicy> = SearchTree::builder(FailingPolicy)
            .with_workers(2)
            .build();

        let result = search.run(&GomokuBoard::new(3, 3), 10);

        assert_matches!(result, Err(SearchError::Inference(InferenceError::Disconnected)));
        assert_eq!(search.root_visits(), 0);
        assert!(search.get_root().is_leaf());
    }

    #[test]
    fn works_with_thread_local_random() {
        let search: SearchTree<GomokuBoard, RolloutPolicy> =
            SearchTree::builder(RolloutPolicy::new(StandardRandomGenerator))
                .with_workers(4)
                .with_playouts(64)
                .build();

        let action = search.choose_action(&GomokuBoard::new(4, 3)).unwrap();

        assert!(action < 16);
    }
}
