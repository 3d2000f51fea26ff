//! Integration tests for the POLYZERO self-play stack
//!
//! Tests the full pipeline: search over the built-in game, the distribution
//! server/client pair, and the selfplay harness end to end.

use std::sync::Arc;

use polyzero_cli::game::TakeStones;
use polyzero_cli::selfplay::{self, SelfplayArgs};
use polyzero_core::{State, StateDict, Tensor, UniformActor};
use polyzero_dist::{DistributedServer, DEV_MODEL_ID};
use polyzero_mcts::{MctsConfig, Search};

// ============================================================================
// SEARCH OVER THE BUILT-IN GAME
// ============================================================================

#[test]
fn test_search_finds_winning_take() {
    // 4 stones: taking one leaves the opponent on a losing multiple of 3.
    let actor = Arc::new(UniformActor::new());
    let config = MctsConfig::default().with_rollouts(400).with_seed(1);
    let mut search = Search::new(actor, config);

    let state = TakeStones::new(4);
    let result = search.run(&[&state as &dyn State]).unwrap();
    assert_eq!(result.roots[0].best_action, 0);

    // 5 stones: taking two does the same.
    let state = TakeStones::new(5);
    let result = search.run(&[&state as &dyn State]).unwrap();
    assert_eq!(result.roots[0].best_action, 1);
}

#[test]
fn test_search_batch_over_positions() {
    let actor = Arc::new(UniformActor::new());
    let config = MctsConfig::default().with_rollouts(100).with_seed(2);
    let mut search = Search::new(actor, config);

    let states: Vec<TakeStones> = (1..9).map(TakeStones::new).collect();
    let refs: Vec<&dyn State> = states.iter().map(|s| s as &dyn State).collect();
    let result = search.run(&refs).unwrap();
    assert_eq!(result.roots.len(), 8);
    for root in &result.roots {
        assert!(root.best_action == 0 || root.best_action == 1);
    }
}

// ============================================================================
// END-TO-END SELF-PLAY
// ============================================================================

fn dev_state_dict() -> StateDict {
    let mut sd = StateDict::default();
    sd.insert(
        "marker".to_string(),
        Tensor::from_f32(vec![1], &[1.0]).unwrap(),
    );
    sd
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_selfplay_against_local_server() {
    let server = DistributedServer::start(Some("127.0.0.1:0"), |_| {})
        .await
        .unwrap();
    server.update_model(DEV_MODEL_ID, dev_state_dict());

    let args = SelfplayArgs {
        endpoint: Some(server.endpoint()),
        endpoints_file: None,
        games: 2,
        rollouts: 32,
        stones: 8,
        tournament: false,
    };
    selfplay::run(args).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_selfplay_reports_results_for_rating() {
    let server = DistributedServer::start(Some("127.0.0.1:0"), |_| {})
        .await
        .unwrap();
    server.update_model(DEV_MODEL_ID, dev_state_dict());
    server.update_model("rival", dev_state_dict());
    let rival_before = server.rating("rival").unwrap();

    let args = SelfplayArgs {
        endpoint: Some(server.endpoint()),
        endpoints_file: None,
        games: 1,
        rollouts: 16,
        stones: 6,
        tournament: false,
    };
    selfplay::run(args).await.unwrap();

    // Self-play on dev leaves other ratings untouched.
    assert_eq!(server.rating("rival").unwrap(), rival_before);
    // Dev never plays against itself in the ratings.
    assert_eq!(server.rating(DEV_MODEL_ID).unwrap(), 0.0);
}
