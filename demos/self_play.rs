extern crate parallel_mcts;

use parallel_mcts::board::{GameOutcome, GameState};
use parallel_mcts::boards::gomoku::GomokuBoard;
use parallel_mcts::error::SearchError;
use parallel_mcts::mcts::SearchTree;
use parallel_mcts::policy::RolloutPolicy;
use parallel_mcts::random::StandardRandomGenerator;

fn main() -> Result<(), SearchError> {
    let mut board = GomokuBoard::new(6, 4);

    // One search tree per player, both following every move so their subtrees are reused
    let mut players = [player(), player()];

    while !board.get_outcome().is_terminal() {
        let turn = board.move_count() % 2;
        let action = players[turn].choose_action(&board)?;
        let visits = players[turn]
            .root_stats()
            .iter()
            .find(|s| s.action == action)
            .map_or(0, |s| s.visits);
        println!(
            "{:?} plays ({}, {}) after {} playouts, {visits} on the chosen move",
            board.get_current_player(),
            action / board.size(),
            action % board.size(),
            players[turn].root_visits(),
        );

        board.perform_move(action);
        for search in &mut players {
            search.update_with_move(action);
        }
    }

    print!("{board}");
    match board.get_outcome() {
        GameOutcome::Winner(stone) => println!("{stone:?} wins"),
        _ => println!("Draw"),
    }
    Ok(())
}

fn player() -> SearchTree<GomokuBoard, RolloutPolicy> {
    SearchTree::builder(RolloutPolicy::new(StandardRandomGenerator))
        .with_workers(4)
        .with_playouts(800)
        .build()
}
