use std::fmt::Debug;

/// The central trait of the library, defining the interface for a game state.
///
/// To search a custom game, this trait must be implemented. Every playout works on its own
/// clone of the state, so `perform_move` may freely mutate `self`.
///
/// Actions are dense indices in `0..get_action_size()`. Evaluation policies return priors
/// indexed by action, and `get_available_moves` lists the legal subset.
pub trait GameState: Clone + Send + Sync + 'static {
    /// Identifies a player. Compared against the winner reported by `get_outcome`.
    type Player: Copy + Eq + Debug + Send + Sync;

    /// Returns the player whose turn it is to make a move.
    fn get_current_player(&self) -> Self::Player;

    /// Returns the current outcome of the game.
    ///
    /// A state without legal moves must report a finished outcome, since the search never
    /// asks for priors over an empty action set.
    fn get_outcome(&self) -> GameOutcome<Self::Player>;

    /// Returns a list of all legal moves available from the current state.
    fn get_available_moves(&self) -> Vec<usize>;

    /// Applies a given move to the state. The move must be legal.
    fn perform_move(&mut self, action: usize);

    /// Returns the size of the fixed action space.
    fn get_action_size(&self) -> usize;

    /// Encodes the state into the flat numeric representation a model consumes.
    ///
    /// Every state of one game must encode to the same length.
    fn encode(&self) -> Vec<f32>;
}

/// Represents the possible outcomes of a game.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum GameOutcome<P> {
    /// The game is still ongoing.
    InProgress,
    /// The game has ended in a draw.
    Draw,
    /// The game has ended and the given player has won.
    Winner(P),
}

impl<P: PartialEq> GameOutcome<P> {
    /// Returns `true` if the game has ended.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GameOutcome::InProgress)
    }

    /// Scores a finished game from the point of view of `player`:
    /// `1` for a win, `-1` for a loss, `0` for a draw or an unfinished game.
    pub fn value_for(&self, player: &P) -> f64 {
        match self {
            GameOutcome::Winner(winner) if winner == player => 1.0,
            GameOutcome::Winner(_) => -1.0,
            GameOutcome::Draw | GameOutcome::InProgress => 0.0,
        }
    }
}
