//! Tests for query pipelining strategies

mod common;

use common::{config, insert, pool, MemoryDb};
use kailash_pool::prelude::*;
use std::sync::atomic::Ordering;

fn pipelined(strategy: ExecutionStrategy, batch_size: usize) -> PoolConfig {
    config(1, 4)
        .with_pipelining(batch_size)
        .with_pipeline_settings(PipelineSettings {
            strategy,
            max_parallelism: 2,
            ..Default::default()
        })
}

fn enqueue_insert(pipeline: &Pipeline, key: &str) -> PipelineTicket {
    let (sql, params) = insert(key);
    pipeline.add_query(sql, params).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_pipelining_must_be_enabled() {
    let db = MemoryDb::new();
    let pool = pool(&db, config(1, 2)).await;
    let err = pool.pipeline().unwrap_err();
    assert!(matches!(err, Error::Unsupported { .. }));
}

// ==================== Transactional ====================

#[tokio::test(start_paused = true)]
async fn test_transactional_failure_rolls_back_batch() {
    let db = MemoryDb::new();
    db.seed("existing", "v");
    let pool = pool(&db, pipelined(ExecutionStrategy::Transactional, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    let tickets = vec![
        enqueue_insert(&pipeline, "a"),
        enqueue_insert(&pipeline, "b"),
        enqueue_insert(&pipeline, "existing"),
        enqueue_insert(&pipeline, "c"),
        enqueue_insert(&pipeline, "d"),
    ];
    let outcome = pipeline.flush().await;

    assert!(!outcome.committed);
    assert_eq!(outcome.len(), 5);
    assert_eq!(outcome.statuses[0], QueryStatus::RolledBack);
    assert_eq!(outcome.statuses[1], QueryStatus::RolledBack);
    assert!(matches!(
        outcome.statuses[2],
        QueryStatus::Failed {
            category: ErrorCategory::Constraint,
            ..
        }
    ));
    assert_eq!(outcome.statuses[3], QueryStatus::Skipped);
    assert_eq!(outcome.statuses[4], QueryStatus::Skipped);

    let mut resolved = Vec::new();
    for ticket in tickets {
        resolved.push(ticket.wait().await);
    }
    assert_eq!(resolved, outcome.statuses);

    // nothing from the batch is visible
    assert_eq!(db.rows(), vec![("existing".to_string(), "v".to_string())]);
    // a constraint violation is the caller's problem, not the database's
    assert_eq!(pool.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_transactional_success_commits() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::Transactional, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    for key in ["a", "b", "c"] {
        enqueue_insert(&pipeline, key);
    }
    let count = pipeline.add_query("SELECT COUNT(*) FROM kv", vec![]).unwrap();
    let outcome = pipeline.flush().await;

    assert!(outcome.committed);
    assert_eq!(outcome.succeeded(), 4);
    assert_eq!(db.rows().len(), 3);

    // the count sees the transaction's own writes
    let status = count.wait().await;
    let row = status.outcome().and_then(|o| o.first()).cloned().unwrap();
    assert_eq!(row.get_by_name("count"), Some(&Value::Int64(3)));
    assert_eq!(pool.stats().active, 0);
}

// ==================== Best Effort ====================

#[tokio::test(start_paused = true)]
async fn test_best_effort_runs_every_query() {
    let db = MemoryDb::new();
    db.seed("dup", "v");
    let pool = pool(&db, pipelined(ExecutionStrategy::BestEffort, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    for key in ["a", "dup", "b", "c", "d"] {
        enqueue_insert(&pipeline, key);
    }
    let outcome = pipeline.flush().await;

    assert_eq!(outcome.strategy, ExecutionStrategy::BestEffort);
    assert!(!outcome.committed);
    assert_eq!(outcome.succeeded(), 4);
    assert_eq!(outcome.failed(), 1);
    assert!(matches!(outcome.statuses[1], QueryStatus::Failed { .. }));
    assert_eq!(db.rows().len(), 5);

    let snapshot = pool.metrics().snapshot();
    assert_eq!(snapshot.queries.get(&QueryType::Insert), Some(&5));
    assert_eq!(snapshot.errors.get(&ErrorCategory::Constraint), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_best_effort_replaces_lost_connection() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::BestEffort, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    enqueue_insert(&pipeline, "a");
    pipeline.add_query("SELECT LOSTCONN", vec![]).unwrap();
    enqueue_insert(&pipeline, "b");
    let outcome = pipeline.flush().await;

    assert_eq!(outcome.succeeded(), 2);
    assert!(matches!(
        outcome.statuses[1],
        QueryStatus::Failed {
            category: ErrorCategory::Connection,
            ..
        }
    ));
    assert_eq!(db.rows().len(), 2);
    assert_eq!(
        pool.metrics().snapshot().recycled.get(&RecycleReason::Broken),
        Some(&1)
    );
}

// ==================== Sequential ====================

#[tokio::test(start_paused = true)]
async fn test_sequential_stops_at_first_failure() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::Sequential, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    enqueue_insert(&pipeline, "a");
    pipeline.add_query("UPDATE BROKEN SET v = 1", vec![]).unwrap();
    enqueue_insert(&pipeline, "b");
    enqueue_insert(&pipeline, "c");
    let outcome = pipeline.flush().await;

    assert!(outcome.statuses[0].is_success());
    assert!(matches!(outcome.statuses[1], QueryStatus::Failed { .. }));
    assert_eq!(outcome.statuses[2], QueryStatus::Skipped);
    assert_eq!(outcome.statuses[3], QueryStatus::Skipped);
    // the first write is not undone
    assert_eq!(db.rows().len(), 1);
}

// ==================== Parallel ====================

#[tokio::test(start_paused = true)]
async fn test_parallel_rejects_writes() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::Parallel, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    let (sql, params) = insert("a");
    let err = pipeline.add_query(sql, params).unwrap_err();
    assert!(matches!(err, Error::Unsupported { .. }));
    assert_eq!(pipeline.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_reads_use_separate_connections() {
    let db = MemoryDb::new();
    db.seed("a", "v");
    let pool = pool(&db, pipelined(ExecutionStrategy::Parallel, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    for _ in 0..6 {
        pipeline.add_query("SELECT SLOW k FROM kv", vec![]).unwrap();
    }
    let start = tokio::time::Instant::now();
    let outcome = pipeline.flush().await;

    assert_eq!(outcome.succeeded(), 6);
    assert!(outcome.committed);
    assert_eq!(db.overlaps.load(Ordering::SeqCst), 0);
    // two at a time, 100ms each
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_millis(600));
    assert!(db.opened() <= 2);
}

// ==================== Flushing ====================

#[tokio::test(start_paused = true)]
async fn test_full_batch_flushes_automatically() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::BestEffort, 3)).await;
    let pipeline = pool.pipeline().unwrap();

    let tickets: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|k| enqueue_insert(&pipeline, k))
        .collect();
    for ticket in tickets {
        assert!(ticket.wait().await.is_success());
    }
    assert_eq!(db.rows().len(), 3);
    assert_eq!(pipeline.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_flushes_after_interval() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::BestEffort, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    let start = tokio::time::Instant::now();
    let ticket = enqueue_insert(&pipeline, "a");
    assert!(ticket.wait().await.is_success());
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(db.rows().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_remaining_queries() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::BestEffort, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    let ticket = enqueue_insert(&pipeline, "a");
    let outcome = pipeline.close().await;
    assert_eq!(outcome.len(), 1);
    assert!(ticket.wait().await.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_empty_flush() {
    let db = MemoryDb::new();
    let pool = pool(&db, pipelined(ExecutionStrategy::Transactional, 100)).await;
    let pipeline = pool.pipeline().unwrap();

    let outcome = pipeline.flush().await;
    assert!(outcome.is_empty());
    assert!(outcome.committed);
    assert_eq!(db.statements.load(Ordering::SeqCst), 0);
}
