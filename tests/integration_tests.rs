//! Integration tests for the rating service
//!
//! These tests drive the whole pipeline through `RatingService::enqueue`:
//! - Ingest, rating update and atomic commit of finished matches
//! - Deduplication of redelivered matches
//! - Per-player ordering under slow commits
//! - Retry of transient store failures and stopping on exhausted retries
//! - Rejection of malformed input
//! - Lifecycle guards, maintenance decay and draining on shutdown

mod fixtures;

use rating_service::amqp::MockRatingPublisher;
use rating_service::ingest::AckDecision;
use rating_service::store::{InMemoryRatingStore, RatingStore, SqliteRatingStore};
use rating_service::types::{RejectionReason, SkillRating, UpdateCause};
use rating_service::{RatingService, RatingServiceError};
use std::sync::Arc;
use std::time::Duration;

use fixtures::{
    duel, outcome_match, process, ranked_match, settled, start_service, start_with_store,
    test_config, LEADERBOARD,
};

#[tokio::test]
async fn test_match_result_updates_ratings_and_leaderboard() {
    let (mut service, store) = start_service(test_config()).await;
    let leaderboard = LEADERBOARD.to_string();

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);

    let alice = store.current_rating(&"alice".to_string(), &leaderboard).await.unwrap();
    let bob = store.current_rating(&"bob".to_string(), &leaderboard).await.unwrap();
    assert!(alice.rating.mean > 1500.0);
    assert!(bob.rating.mean < 1500.0);
    assert!(alice.rating.uncertainty < 500.0);
    assert_eq!(alice.total_games, 1);
    assert_eq!(alice.won_games, 1);
    assert_eq!(bob.won_games, 0);

    let top = store.leaderboard(&leaderboard, 10).await.unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].player_id, "alice");
    assert_eq!(top[0].position, 1);

    let history = store.history(&"alice".to_string(), &leaderboard).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].match_id.as_deref(), Some("m-1"));

    let summary = service.shutdown().await.unwrap();
    assert_eq!(summary.committed, 1);
    assert_eq!(service.metrics().pipeline().matches_processed_total.get(), 1);
}

#[tokio::test]
async fn test_redelivered_match_is_applied_once() {
    let (mut service, store) = start_service(test_config()).await;

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    let after_first = store
        .current_rating(&"alice".to_string(), &LEADERBOARD.to_string())
        .await
        .unwrap();

    // A redelivery is acknowledged without a second application
    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    let after_second = store
        .current_rating(&"alice".to_string(), &LEADERBOARD.to_string())
        .await
        .unwrap();

    assert_eq!(after_first, after_second);
    assert_eq!(store.inner().history_len(), 2);
    assert_eq!(service.metrics().pipeline().matches_duplicate_total.get(), 1);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shared_player_updates_follow_delivery_order() {
    let (mut service, store) = start_service(test_config()).await;
    store.delay_commit("m-1", Duration::from_millis(300));

    let first = service.enqueue(duel("m-1", "alice", "bob")).await.unwrap();
    let second = service.enqueue(duel("m-2", "carol", "alice")).await.unwrap();
    let unrelated = service.enqueue(duel("m-3", "dave", "erin")).await.unwrap();

    // Disjoint players are not held up by the slow commit
    assert_eq!(settled(unrelated).await, AckDecision::Ack);
    assert!(store.inner().history_len() >= 2);

    assert_eq!(settled(first).await, AckDecision::Ack);
    assert_eq!(settled(second).await, AckDecision::Ack);

    let history = store
        .history(&"alice".to_string(), &LEADERBOARD.to_string())
        .await
        .unwrap();
    let order: Vec<_> = history.iter().filter_map(|h| h.match_id.as_deref()).collect();
    assert_eq!(order, vec!["m-1", "m-2"]);
    // The second update was computed from the first one's posterior
    assert_eq!(history[1].previous, history[0].new);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_commit_failures_are_retried() {
    let (mut service, store) = start_service(test_config()).await;
    store.fail_next_commits(2);

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    assert_eq!(store.commit_attempts(), 3);
    assert_eq!(store.inner().history_len(), 2);
    assert_eq!(service.metrics().pipeline().matches_retried_total.get(), 2);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_requeue_and_stop_consumption() {
    let (mut service, store) = start_service(test_config()).await;
    store.fail_next_commits(u32::MAX);
    let stopped = service.pipeline_stopped();

    assert_eq!(
        process(&service, duel("m-1", "alice", "bob")).await,
        AckDecision::Requeue
    );
    tokio::time::timeout(Duration::from_secs(5), stopped)
        .await
        .expect("pipeline stops after a fatal failure");

    // Nothing partial was written
    assert_eq!(store.inner().history_len(), 0);
    assert!(service.enqueue(duel("m-2", "carol", "dave")).await.is_err());

    let err = service.shutdown().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RatingServiceError>(),
        Some(RatingServiceError::RetryBudgetExhausted { attempts: 3, .. })
    ));
}

#[tokio::test]
async fn test_malformed_messages_are_rejected_without_side_effects() {
    let (mut service, store) = start_service(test_config()).await;

    assert_eq!(
        process(&service, b"{ not json".to_vec()).await,
        AckDecision::Reject
    );
    // One team is not a match
    assert_eq!(
        process(&service, ranked_match("m-1", &[(&["alice"], 0)])).await,
        AckDecision::Reject
    );
    // A player on both teams
    assert_eq!(
        process(&service, ranked_match("m-2", &[(&["alice"], 0), (&["alice"], 1)])).await,
        AckDecision::Reject
    );

    let metrics = service.metrics();
    assert_eq!(metrics.rejected_count(RejectionReason::Deserialize), 1);
    assert_eq!(metrics.rejected_count(RejectionReason::Validation), 2);
    assert_eq!(store.inner().history_len(), 0);
    assert_eq!(store.commit_attempts(), 0);

    // Consumption continues after rejections
    assert_eq!(process(&service, duel("m-3", "alice", "bob")).await, AckDecision::Ack);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unserved_leaderboard_is_rejected() {
    let mut config = test_config();
    config.processing.allowed_leaderboards = vec!["ladder_1v1".to_string()];
    let (mut service, store) = start_service(config).await;

    assert_eq!(
        process(&service, duel("m-1", "alice", "bob")).await,
        AckDecision::Reject
    );
    assert_eq!(
        service.metrics().rejected_count(RejectionReason::Leaderboard),
        1
    );
    assert_eq!(store.inner().history_len(), 0);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_outcome_vocabulary_and_draws() {
    let (mut service, store) = start_service(test_config()).await;

    let payload = outcome_match(42, "ladder_1v1", &[(&[1], "VICTORY"), (&[2], "DEFEAT")]);
    assert_eq!(process(&service, payload).await, AckDecision::Ack);

    let draw = outcome_match(43, "ladder_1v1", &[(&[3], "DRAW"), (&[4], "MUTUAL_DRAW")]);
    assert_eq!(process(&service, draw).await, AckDecision::Ack);

    let conflicting = outcome_match(44, "ladder_1v1", &[(&[1], "VICTORY"), (&[2], "CONFLICTING")]);
    assert_eq!(process(&service, conflicting).await, AckDecision::Reject);

    let leaderboard = "ladder_1v1".to_string();
    let winner = store.current_rating(&"1".to_string(), &leaderboard).await.unwrap();
    assert!(winner.rating.mean > 1500.0);

    let drawn = store.current_rating(&"3".to_string(), &leaderboard).await.unwrap();
    assert!((drawn.rating.mean - 1500.0).abs() < 1e-6);
    assert!(drawn.rating.uncertainty < 500.0);
    assert_eq!(drawn.won_games, 0);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_notifications_published_after_commit() {
    let config = test_config();
    let inner = Arc::new(InMemoryRatingStore::new(config.rating.initial_rating()));
    let publisher = Arc::new(MockRatingPublisher::new());
    let mut service = RatingService::with_store(config, inner).unwrap();
    service.set_publisher(publisher.clone());
    service.start().await.unwrap();

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    service.shutdown().await.unwrap();

    let published = publisher.published();
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|event| event.match_id.as_deref() == Some("m-1")));
}

#[tokio::test]
async fn test_failed_notifications_do_not_block_acknowledgement() {
    let config = test_config();
    let inner = Arc::new(InMemoryRatingStore::new(config.rating.initial_rating()));
    let publisher = Arc::new(MockRatingPublisher::new());
    publisher.set_failing(true);
    let mut service = RatingService::with_store(config, inner.clone()).unwrap();
    service.set_publisher(publisher);
    service.start().await.unwrap();

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    assert_eq!(inner.history_len(), 2);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sqlite_store_end_to_end() {
    let config = test_config();
    let store = Arc::new(
        SqliteRatingStore::memory(config.rating.initial_rating())
            .await
            .unwrap(),
    );
    let mut service = start_with_store(config, store.clone()).await;

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    assert_eq!(process(&service, duel("m-2", "bob", "alice")).await, AckDecision::Ack);
    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);

    let history = store
        .history(&"alice".to_string(), &LEADERBOARD.to_string())
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(store.has_processed(&"m-2".to_string()).await.unwrap());

    let summary = service.shutdown().await.unwrap();
    assert_eq!(summary.committed, 2);
}

#[tokio::test]
async fn test_input_refused_outside_running_window() {
    let store = Arc::new(InMemoryRatingStore::new(SkillRating::new(1500.0, 500.0)));
    let mut service = RatingService::with_store(test_config(), store).unwrap();

    let before = service.enqueue(duel("m-1", "alice", "bob")).await.unwrap_err();
    assert!(matches!(
        before.downcast_ref::<RatingServiceError>(),
        Some(RatingServiceError::ServiceNotReady { .. })
    ));

    service.start().await.unwrap();
    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    service.shutdown().await.unwrap();

    let after = service.enqueue(duel("m-2", "alice", "bob")).await.unwrap_err();
    assert!(matches!(
        after.downcast_ref::<RatingServiceError>(),
        Some(RatingServiceError::ServiceNotReady { .. })
    ));
}

#[tokio::test]
async fn test_maintenance_decays_inactive_players() {
    let mut config = test_config();
    config.maintenance.inactivity_seconds = 0;
    config.maintenance.decay_per_run = 50.0;
    let (mut service, store) = start_service(config).await;

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);
    let before = store
        .current_rating(&"alice".to_string(), &LEADERBOARD.to_string())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = service.run_maintenance(None).await.unwrap();
    assert_eq!(report.decayed, 2);
    assert_eq!(report.failed, 0);

    let after = store
        .current_rating(&"alice".to_string(), &LEADERBOARD.to_string())
        .await
        .unwrap();
    assert_eq!(after.rating.mean, before.rating.mean);
    assert!(after.rating.uncertainty > before.rating.uncertainty);
    assert_eq!(after.total_games, before.total_games);

    let log = store.inner().commit_log();
    assert_eq!(log.last().map(|commit| &commit.cause), Some(&UpdateCause::Decay));

    service.shutdown().await.unwrap();
}

/// Wait until some match holds its player keys
async fn wait_for_keys_held(service: &RatingService) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.coordinator().pending_keys() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("match took its keys");
}

#[tokio::test]
async fn test_decay_waits_for_in_flight_match() {
    let mut config = test_config();
    config.maintenance.inactivity_seconds = 0;
    config.maintenance.decay_per_run = 50.0;
    let (mut service, store) = start_service(config).await;

    assert_eq!(process(&service, duel("m-1", "alice", "bob")).await, AckDecision::Ack);

    store.delay_commit("m-2", Duration::from_millis(300));
    let slow = service.enqueue(duel("m-2", "carol", "alice")).await.unwrap();
    wait_for_keys_held(&service).await;

    let report = service.run_maintenance(None).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(settled(slow).await, AckDecision::Ack);

    let history = store
        .history(&"alice".to_string(), &LEADERBOARD.to_string())
        .await
        .unwrap();
    let causes: Vec<_> = history.iter().map(|h| h.match_id.as_deref()).collect();
    assert_eq!(causes, vec![Some("m-1"), Some("m-2"), None]);
    // Decay started from the match's posterior, not a stale read
    assert_eq!(history[2].previous, history[1].new);
    assert_eq!(history[2].new.mean, history[1].new.mean);
    assert!(history[2].new.uncertainty > history[1].new.uncertainty);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_commit() {
    let (mut service, store) = start_service(test_config()).await;
    store.delay_commit("m-1", Duration::from_millis(300));

    let slow = service.enqueue(duel("m-1", "alice", "bob")).await.unwrap();
    wait_for_keys_held(&service).await;

    let summary = service.shutdown().await.unwrap();
    assert_eq!(summary.committed, 1);
    assert_eq!(settled(slow).await, AckDecision::Ack);
    assert_eq!(store.inner().history_len(), 2);
}
