//! End-to-end engine scenarios against a live PostgreSQL.
//!
//! These tests exercise the real claim/ack/reap cycle and are ignored by
//! default: set `RELAY_TEST_PG_URL` to a scratch database and run
//! `cargo test -p relay-engine -- --ignored` to execute them. Each test
//! uses uniquely named queues so the suite can run in parallel against a
//! shared database.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use relay_core::config::RelayConfig;
use relay_core::types::{NewMessage, QueueType};
use relay_engine::{DequeueOptions, EngineError, MoveOptions, NackOutcome, NewQueue, Relay};

const PG_ENV: &str = "RELAY_TEST_PG_URL";

fn test_url() -> String {
    relay_core::config::load_dotenv();
    std::env::var(PG_ENV).unwrap_or_else(|_| panic!("set {PG_ENV} to run these tests"))
}

async fn engine_with(tweak: impl FnOnce(&mut RelayConfig)) -> Relay {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut config = RelayConfig::from_env();
    config.database.pg_url = Some(test_url());
    // Tests drive the reaper explicitly.
    config.engine.overdue_check_interval_ms = 3_600_000;
    config.engine.reaper_advisory_lock = false;
    tweak(&mut config);
    Relay::start(config).await.expect("engine start")
}

async fn engine() -> Relay {
    engine_with(|_| {}).await
}

async fn raw_pool() -> PgPool {
    PgPoolOptions::new()
        .max_connections(2)
        .connect(&test_url())
        .await
        .expect("raw pool")
}

fn unique_queue(prefix: &str) -> String {
    format!("{prefix}-{}", relay_core::id::message_id())
}

fn payload(n: i64) -> NewMessage {
    NewMessage::with_payload(serde_json::json!({ "n": n }))
}

async fn create_queue(relay: &Relay, prefix: &str) -> String {
    let name = unique_queue(prefix);
    relay
        .create_queue(NewQueue::standard(&name))
        .await
        .expect("create queue");
    name
}

// ── Seed scenarios ────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn priority_and_fifo_ordering() {
    // Wide priority ladder so priority 10 is representable as-is.
    let relay = engine_with(|cfg| cfg.engine.max_priority_levels = 16).await;
    let queue = create_queue(&relay, "s1").await;

    for priority in [1, 10, 5] {
        let mut msg = payload(priority as i64);
        msg.priority = Some(priority);
        msg.message_type = Some("t".into());
        relay.enqueue(&queue, msg).await.expect("enqueue");
    }

    let mut claimed = Vec::new();
    for _ in 0..3 {
        let claim = relay
            .dequeue(&queue, DequeueOptions::default())
            .await
            .expect("dequeue")
            .expect("claim");
        claimed.push(claim.message.priority);
    }
    assert_eq!(claimed, vec![10, 5, 1]);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn split_brain_ack_rejected_by_fencing_token() {
    let relay = engine().await;
    let pool = raw_pool().await;
    let queue = create_queue(&relay, "s2").await;

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");

    // Worker A claims.
    let claim_a = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue A")
        .expect("claim A");

    // Force the lock into the past and let the reaper reclaim it.
    sqlx::query("UPDATE messages SET locked_until = NOW() - INTERVAL '10 seconds' WHERE id = $1")
        .bind(&inserted.id)
        .execute(&pool)
        .await
        .expect("expire lock");
    relay.run_reaper_pass().await.expect("reaper pass");

    // Worker B claims the recovered message with a fresh token.
    let claim_b = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue B")
        .expect("claim B");
    assert_ne!(claim_a.lock_token, claim_b.lock_token);

    // A's ack is rejected, B's succeeds.
    let stale = relay.ack(&inserted.id, Some(&claim_a.lock_token)).await;
    assert!(matches!(stale, Err(EngineError::LockLost(_))));
    relay
        .ack(&inserted.id, Some(&claim_b.lock_token))
        .await
        .expect("ack B");

    let row: (String, i32) =
        sqlx::query_as("SELECT status, attempt_count FROM messages WHERE id = $1")
            .bind(&inserted.id)
            .fetch_one(&pool)
            .await
            .expect("reread");
    assert_eq!(row.0, "acknowledged");
    assert_eq!(row.1, 2);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn nack_moves_to_dlq_after_max_attempts() {
    let relay = engine().await;
    let pool = raw_pool().await;
    let queue = unique_queue("s3");
    let mut new_queue = NewQueue::standard(&queue);
    new_queue.max_attempts = Some(1);
    relay.create_queue(new_queue).await.expect("create queue");

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");
    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");
    assert_eq!(claim.attempt_count, 1);

    let outcome = relay
        .nack(&inserted.id, Some(&claim.lock_token), Some("fatal"))
        .await
        .expect("nack");
    assert_eq!(outcome, NackOutcome::MovedToDlq);

    let dlq: Vec<(String, String)> = sqlx::query_as(
        "SELECT id, last_error FROM messages WHERE queue_name = $1 AND status = 'dead'",
    )
    .bind(&queue)
    .fetch_all(&pool)
    .await
    .expect("dlq query");
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].0, inserted.id);
    assert_eq!(dlq[0].1, "fatal");

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn touch_prevents_reaper_timeout() {
    let relay = engine().await;
    let pool = raw_pool().await;
    let queue = unique_queue("s4");
    let mut new_queue = NewQueue::standard(&queue);
    new_queue.ack_timeout_seconds = Some(2);
    relay.create_queue(new_queue).await.expect("create queue");

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");
    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let receipt = relay
        .touch(&inserted.id, &claim.lock_token, None)
        .await
        .expect("touch");
    assert!(receipt.new_timeout_at > chrono::Utc::now() + chrono::Duration::seconds(1));
    assert_eq!(receipt.lock_token, claim.lock_token);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    relay.run_reaper_pass().await.expect("reaper pass");

    // The heartbeat kept the claim alive.
    let status: String = sqlx::query_scalar("SELECT status FROM messages WHERE id = $1")
        .bind(&inserted.id)
        .fetch_one(&pool)
        .await
        .expect("status");
    assert_eq!(status, "processing");
    relay
        .ack(&inserted.id, Some(&claim.lock_token))
        .await
        .expect("ack");

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn concurrent_dequeues_are_exclusive() {
    let relay = Arc::new(engine().await);
    let queue = create_queue(&relay, "s5").await;

    let mut expected = HashSet::new();
    for n in 0..10 {
        let inserted = relay.enqueue(&queue, payload(n)).await.expect("enqueue");
        expected.insert(inserted.id);
    }

    let mut handles = Vec::new();
    for _ in 0..10 {
        let relay = relay.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            relay
                .dequeue(&queue, DequeueOptions::default())
                .await
                .expect("dequeue")
        }));
    }

    let mut ids = HashSet::new();
    let mut tokens = HashSet::new();
    for handle in handles {
        let claim = handle.await.expect("join").expect("every worker claims");
        ids.insert(claim.message.id.clone());
        tokens.insert(claim.lock_token.clone());
    }
    assert_eq!(ids, expected);
    assert_eq!(tokens.len(), 10);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn nack_restores_original_priority() {
    let relay = engine().await;
    let pool = raw_pool().await;
    let queue = create_queue(&relay, "s6").await;

    let mut msg = payload(1);
    msg.priority = Some(3);
    let inserted = relay.enqueue(&queue, msg).await.expect("enqueue");

    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");

    // Simulate priority drift while the message is processing.
    sqlx::query("UPDATE messages SET priority = 1 WHERE id = $1")
        .bind(&inserted.id)
        .execute(&pool)
        .await
        .expect("drift");

    let outcome = relay
        .nack(&inserted.id, Some(&claim.lock_token), None)
        .await
        .expect("nack");
    assert!(matches!(outcome, NackOutcome::Requeued { .. }));

    let (status, priority): (String, i32) =
        sqlx::query_as("SELECT status, priority FROM messages WHERE id = $1")
            .bind(&inserted.id)
            .fetch_one(&pool)
            .await
            .expect("reread");
    assert_eq!(status, "queued");
    assert_eq!(priority, 3);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn fifo_within_one_priority_level() {
    let relay = engine().await;
    let queue = create_queue(&relay, "s1-fifo").await;

    let mut expected = Vec::new();
    for n in 0..3 {
        let inserted = relay.enqueue(&queue, payload(n)).await.expect("enqueue");
        expected.push(inserted.id);
        // Distinct created_at values even on coarse clocks.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for expected_id in expected {
        let claim = relay
            .dequeue(&queue, DequeueOptions::default())
            .await
            .expect("dequeue")
            .expect("claim");
        assert_eq!(claim.message.id, expected_id);
    }

    relay.shutdown().await;
}

// ── Universal invariants ──────────────────────────────────────

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn ack_without_token_is_accepted_for_compatibility() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");
    relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");

    // Legacy callers may omit the fencing token on ack.
    relay.ack(&inserted.id, None).await.expect("tokenless ack");

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn ack_is_not_idempotent_by_design() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");
    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");
    relay
        .ack(&inserted.id, Some(&claim.lock_token))
        .await
        .expect("first ack");

    // A second ack must fail with INVALID_STATE, never succeed twice.
    let second = relay.ack(&inserted.id, Some(&claim.lock_token)).await;
    assert!(matches!(second, Err(EngineError::InvalidState { .. })));

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn lock_tokens_rotate_across_requeues() {
    let relay = engine().await;
    let queue = unique_queue("inv");
    let mut new_queue = NewQueue::standard(&queue);
    new_queue.max_attempts = Some(5);
    relay.create_queue(new_queue).await.expect("create queue");

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");
    let mut tokens = HashSet::new();
    for _ in 0..4 {
        let claim = relay
            .dequeue(&queue, DequeueOptions::default())
            .await
            .expect("dequeue")
            .expect("claim");
        assert!(tokens.insert(claim.lock_token.clone()), "token repeated");
        relay
            .nack(&inserted.id, Some(&claim.lock_token), Some("retry"))
            .await
            .expect("nack");
    }
    assert_eq!(tokens.len(), 4);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn round_trip_preserves_payload() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    let body = serde_json::json!({
        "order": { "id": 991, "lines": [ {"sku": "A-1", "qty": 2}, {"sku": "B-9", "qty": 1} ] },
        "note": "œ∑ unicode ✓",
    });
    let inserted = relay
        .enqueue(&queue, NewMessage::with_payload(body.clone()))
        .await
        .expect("enqueue");

    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");
    assert_eq!(claim.message.payload, body);
    assert_eq!(claim.message.id, inserted.id);
    relay
        .ack(&inserted.id, Some(&claim.lock_token))
        .await
        .expect("ack");

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn dequeue_times_out_with_none() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    let started = std::time::Instant::now();
    let claim = relay
        .dequeue(
            &queue,
            DequeueOptions {
                timeout: Duration::from_millis(600),
                ..Default::default()
            },
        )
        .await
        .expect("dequeue");
    assert!(claim.is_none());
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(started.elapsed() < Duration::from_secs(3));

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn type_filter_only_claims_matching_messages() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    let mut email = payload(1);
    email.message_type = Some("email".into());
    let mut sms = payload(2);
    sms.message_type = Some("sms".into());
    relay.enqueue(&queue, email).await.expect("enqueue email");
    let sms_row = relay.enqueue(&queue, sms).await.expect("enqueue sms");

    let claim = relay
        .dequeue(
            &queue,
            DequeueOptions {
                type_filter: Some("sms".into()),
                ..Default::default()
            },
        )
        .await
        .expect("dequeue")
        .expect("claim");
    assert_eq!(claim.message.id, sms_row.id);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn delete_refuses_non_empty_queue() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    relay.enqueue(&queue, payload(1)).await.expect("enqueue");
    let refused = relay.delete_queue(&queue, false).await;
    assert!(matches!(refused, Err(EngineError::QueueNotEmpty(_))));

    relay.delete_queue(&queue, true).await.expect("force delete");
    let gone = relay.get_queue(&queue, false).await;
    assert!(matches!(gone, Err(EngineError::QueueNotFound(_))));

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn unlogged_queue_routes_to_unlogged_table() {
    let relay = engine().await;
    let pool = raw_pool().await;
    let queue = unique_queue("inv");
    let mut new_queue = NewQueue::standard(&queue);
    new_queue.queue_type = QueueType::Unlogged;
    relay.create_queue(new_queue).await.expect("create queue");

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");

    let in_unlogged: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages_unlogged WHERE id = $1")
            .bind(&inserted.id)
            .fetch_one(&pool)
            .await
            .expect("count");
    assert_eq!(in_unlogged, 1);

    // Claim and ack flow through the same backing table.
    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");
    relay
        .ack(&inserted.id, Some(&claim.lock_token))
        .await
        .expect("ack");

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn requeue_failed_revives_dlq_rows() {
    let relay = engine().await;
    let queue = unique_queue("inv");
    let mut new_queue = NewQueue::standard(&queue);
    new_queue.max_attempts = Some(1);
    relay.create_queue(new_queue).await.expect("create queue");

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");
    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim");
    relay
        .nack(&inserted.id, Some(&claim.lock_token), Some("boom"))
        .await
        .expect("nack");

    let revived = relay.requeue_failed(Some(&queue)).await.expect("requeue");
    assert_eq!(revived, 1);

    let claim = relay
        .dequeue(&queue, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim after revival");
    assert_eq!(claim.message.id, inserted.id);
    assert_eq!(claim.attempt_count, 1);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn move_messages_between_queues() {
    let relay = engine().await;
    let from = create_queue(&relay, "inv-from").await;
    let to = create_queue(&relay, "inv-to").await;

    let a = relay.enqueue(&from, payload(1)).await.expect("enqueue a");
    let b = relay.enqueue(&from, payload(2)).await.expect("enqueue b");

    let moved = relay
        .move_messages(
            &[a.id.clone(), b.id.clone()],
            &from,
            &to,
            &MoveOptions::default(),
        )
        .await
        .expect("move");
    assert_eq!(moved, 2);

    let claim = relay
        .dequeue(&to, DequeueOptions::default())
        .await
        .expect("dequeue")
        .expect("claim from target queue");
    assert!(claim.message.id == a.id || claim.message.id == b.id);
    assert!(relay
        .dequeue(&from, DequeueOptions::default())
        .await
        .expect("dequeue source")
        .is_none());

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn config_cache_invalidated_on_update() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    // Prime the cache through an enqueue.
    relay.enqueue(&queue, payload(1)).await.expect("enqueue");

    relay
        .update_queue(
            &queue,
            relay_engine::QueueConfigPatch {
                max_attempts: Some(7),
                ..Default::default()
            },
        )
        .await
        .expect("update");

    // A freshly enqueued message must see the new default immediately.
    let inserted = relay.enqueue(&queue, payload(2)).await.expect("enqueue");
    assert_eq!(inserted.max_attempts, 7);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn change_broadcaster_emits_enqueue_event() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    let mut rx = relay.subscribe_changes();
    // Let the silent first pass build its snapshot.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let inserted = relay.enqueue(&queue, payload(1)).await.expect("enqueue");

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("broadcast recv");
            if event.queue_name == queue && event.event_type == "enqueue" {
                return event;
            }
        }
    })
    .await
    .expect("enqueue event within deadline");
    assert!(event.ids.contains(&inserted.id));
    assert_eq!(event.count, 1);

    relay.shutdown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set RELAY_TEST_PG_URL)"]
async fn immediate_notify_reaches_channel_subscribers() {
    let relay = engine().await;
    let queue = create_queue(&relay, "inv").await;

    let mut rx = relay.subscribe_channel("queue_events");
    // Give the LISTEN a moment to register.
    tokio::time::sleep(Duration::from_millis(300)).await;

    relay.enqueue(&queue, payload(1)).await.expect("enqueue");

    let raw = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let raw = rx.recv().await.expect("channel recv");
            if raw.contains(&queue) {
                return raw;
            }
        }
    })
    .await
    .expect("notify within deadline");
    let envelope: serde_json::Value = serde_json::from_str(&raw).expect("json payload");
    assert_eq!(envelope["type"], "enqueue");
    assert!(envelope["timestamp_ms"].is_i64());

    relay.shutdown().await;
}
