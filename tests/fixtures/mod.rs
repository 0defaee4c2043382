//! Test fixtures for integration testing
//!
//! Payload builders and service harnesses shared by the integration tests.
//! Deliveries go through [`RatingService::enqueue`], which settles over a
//! oneshot channel the way the AMQP consumer settles with the broker.

#![allow(dead_code)]

use rating_service::config::AppConfig;
use rating_service::ingest::AckDecision;
use rating_service::service::{RatingService, MEMORY_DATABASE_URL};
use rating_service::store::{FaultyRatingStore, InMemoryRatingStore, RatingStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub const LEADERBOARD: &str = "global";

/// Upper bound for any single settlement in these tests
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration tuned for tests: in-memory store, fast retries, no schedule
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = MEMORY_DATABASE_URL.to_string();
    config.processing.max_concurrent_matches = 4;
    config.processing.commit_max_retries = 3;
    config.processing.retry_base_delay_ms = 1;
    config.processing.retry_max_delay_ms = 10;
    config.maintenance.enabled = false;
    config.service.shutdown_timeout_seconds = 5;
    config
}

/// Ranked match payload; each team is a roster and its rank
pub fn ranked_match(match_id: &str, teams: &[(&[&str], u32)]) -> Vec<u8> {
    let teams: Vec<_> = teams
        .iter()
        .map(|(players, rank)| json!({ "players": players, "rank": rank }))
        .collect();
    serde_json::to_vec(&json!({
        "matchId": match_id,
        "leaderboard": LEADERBOARD,
        "teams": teams,
    }))
    .expect("payload serializes")
}

/// 1v1 where `winner` beats `loser`
pub fn duel(match_id: &str, winner: &str, loser: &str) -> Vec<u8> {
    ranked_match(match_id, &[(&[winner], 0), (&[loser], 1)])
}

/// Payload in the game server's outcome vocabulary
pub fn outcome_match(match_id: u64, rating_type: &str, teams: &[(&[u64], &str)]) -> Vec<u8> {
    let teams: Vec<_> = teams
        .iter()
        .map(|(players, outcome)| json!({ "player_ids": players, "outcome": outcome }))
        .collect();
    serde_json::to_vec(&json!({
        "game_id": match_id,
        "rating_type": rating_type,
        "teams": teams,
    }))
    .expect("payload serializes")
}

pub type FaultyStore = Arc<FaultyRatingStore<InMemoryRatingStore>>;

/// Started service over a fault-injecting in-memory store
pub async fn start_service(config: AppConfig) -> (RatingService, FaultyStore) {
    let inner = Arc::new(InMemoryRatingStore::new(config.rating.initial_rating()));
    let store = Arc::new(FaultyRatingStore::new(inner));
    let service = start_with_store(config, store.clone()).await;
    (service, store)
}

/// Started service over any store
pub async fn start_with_store(config: AppConfig, store: Arc<dyn RatingStore>) -> RatingService {
    let mut service = RatingService::with_store(config, store).expect("service builds");
    service.start().await.expect("service starts");
    service
}

/// Wait for one delivery's settlement
pub async fn settled(receiver: oneshot::Receiver<AckDecision>) -> AckDecision {
    tokio::time::timeout(SETTLE_TIMEOUT, receiver)
        .await
        .expect("delivery settled in time")
        .expect("acknowledger dropped without settling")
}

/// Enqueue a payload and wait for its settlement
pub async fn process(service: &RatingService, payload: Vec<u8>) -> AckDecision {
    let receiver = service.enqueue(payload).await.expect("service accepts input");
    settled(receiver).await
}
