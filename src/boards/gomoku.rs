use std::fmt;

use crate::board::{GameOutcome, GameState};

const DEFAULT_SIZE: usize = 15;
const DEFAULT_N_IN_ROW: usize = 5;

/// Horizontal, vertical, diagonal and anti-diagonal.
const DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

/// Number of feature planes produced by [`GomokuBoard::encode`].
pub const PLANES: usize = 4;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Stone {
    Black,
    White,
}

impl Stone {
    pub fn opposite(self) -> Self {
        match self {
            Stone::Black => Stone::White,
            Stone::White => Stone::Black,
        }
    }
}

/// Free-style Gomoku on a `size × size` board: the first player to line up `n_in_row` stones
/// wins, a full board without such a line is a draw.
///
/// Black moves first. The action for the cell at `(row, col)` is `row * size + col`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GomokuBoard {
    size: usize,
    n_in_row: usize,
    cells: Vec<Option<Stone>>,
    current_player: Stone,
    last_move: Option<usize>,
    move_count: usize,
    outcome: GameOutcome<Stone>,
}

impl GomokuBoard {
    pub fn new(size: usize, n_in_row: usize) -> Self {
        Self {
            size,
            n_in_row,
            cells: vec![None; size * size],
            current_player: Stone::Black,
            last_move: None,
            move_count: 0,
            outcome: GameOutcome::InProgress,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn n_in_row(&self) -> usize {
        self.n_in_row
    }

    pub fn last_move(&self) -> Option<usize> {
        self.last_move
    }

    pub fn move_count(&self) -> usize {
        self.move_count
    }

    /// Converts a cell position into an action index.
    pub fn action(&self, row: usize, col: usize) -> usize {
        row * self.size + col
    }

    pub fn stone_at(&self, action: usize) -> Option<Stone> {
        self.cells.get(action).copied().flatten()
    }

    /// `true` if the game is running and the cell is on the board and empty.
    pub fn is_legal(&self, action: usize) -> bool {
        !self.outcome.is_terminal() && matches!(self.cells.get(action), Some(None))
    }

    /// Length of the line of `stone` through `action` along one direction.
    fn line_length(&self, action: usize, stone: Stone, (dr, dc): (isize, isize)) -> usize {
        let (row, col) = ((action / self.size) as isize, (action % self.size) as isize);
        let mut length = 1;
        for sign in [1, -1] {
            let (mut r, mut c) = (row + sign * dr, col + sign * dc);
            while self.holds(r, c, stone) {
                length += 1;
                r += sign * dr;
                c += sign * dc;
            }
        }
        length
    }

    fn holds(&self, row: isize, col: isize, stone: Stone) -> bool {
        let size = self.size as isize;
        (0..size).contains(&row)
            && (0..size).contains(&col)
            && self.cells[(row * size + col) as usize] == Some(stone)
    }
}

impl Default for GomokuBoard {
    /// The standard 15×15 board with five in a row.
    fn default() -> Self {
        GomokuBoard::new(DEFAULT_SIZE, DEFAULT_N_IN_ROW)
    }
}

impl GameState for GomokuBoard {
    type Player = Stone;

    fn get_current_player(&self) -> Stone {
        self.current_player
    }

    fn get_outcome(&self) -> GameOutcome<Stone> {
        self.outcome
    }

    fn get_available_moves(&self) -> Vec<usize> {
        if self.outcome.is_terminal() {
            return Vec::new();
        }

        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_none())
            .map(|(action, _)| action)
            .collect()
    }

    fn perform_move(&mut self, action: usize) {
        debug_assert!(self.is_legal(action), "illegal move {action}");
        let stone = self.current_player;
        self.cells[action] = Some(stone);
        self.last_move = Some(action);
        self.move_count += 1;
        self.current_player = stone.opposite();

        if DIRECTIONS
            .iter()
            .any(|&direction| self.line_length(action, stone, direction) >= self.n_in_row)
        {
            self.outcome = GameOutcome::Winner(stone);
        } else if self.move_count == self.cells.len() {
            self.outcome = GameOutcome::Draw;
        }
    }

    fn get_action_size(&self) -> usize {
        self.cells.len()
    }

    /// Planes of `size * size` values each: black stones, white stones, the last move, and a
    /// plane filled with `1` when Black is to move.
    fn encode(&self) -> Vec<f32> {
        let area = self.cells.len();
        let mut features = vec![0.0; PLANES * area];
        for (i, cell) in self.cells.iter().enumerate() {
            match cell {
                Some(Stone::Black) => features[i] = 1.0,
                Some(Stone::White) => features[area + i] = 1.0,
                None => {}
            }
        }
        if let Some(last) = self.last_move {
            features[2 * area + last] = 1.0;
        }
        if self.current_player == Stone::Black {
            features[3 * area..].fill(1.0);
        }
        features
    }
}

impl fmt::Display for GomokuBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.cells.chunks(self.size.max(1)) {
            let line: String = row
                .iter()
                .map(|cell| match cell {
                    None => '.',
                    Some(Stone::Black) => 'x',
                    Some(Stone::White) => 'o',
                })
                .collect();
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
