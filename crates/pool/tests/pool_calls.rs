//! Pooled call tests: session accounting, deadlines, panics and exclusivity.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nebula_pool::testing::{MemoryCollection, MemoryConnector, MemoryError, MemorySession};
use nebula_pool::{BoxError, ConnectOptions, Connector, Error, Pool, Registry, Session};
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::task::JoinSet;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn pool(
    worker_count: usize,
    queue_capacity: usize,
    timeout: Duration,
) -> Arc<Pool<MemorySession>> {
    let options = ConnectOptions::new("mem:27017", "test").with_timeout(timeout);
    Arc::new(
        Pool::connect("items", &MemoryConnector::new(), &options, worker_count, queue_capacity)
            .await
            .unwrap(),
    )
}

/// Tracks how many calls are inside their work function at once.
#[derive(Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    async fn hold(&self, c: &MemoryCollection, dwell: Duration) -> Result<usize, MemoryError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(dwell).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        c.count()
    }
}

/// Session whose collection views cannot be built for one name.
struct FragileSession;

#[async_trait]
impl Session for FragileSession {
    type Database = ();
    type Collection = String;

    fn duplicate(&self) -> Self {
        Self
    }

    fn database(&self, _name: &str) {}

    fn collection(&self, _database: &str, name: &str) -> String {
        if name == "bad" {
            panic!("no collection named {name}");
        }
        name.to_owned()
    }

    async fn close(self) -> Result<(), BoxError> {
        Ok(())
    }
}

struct FragileConnector;

#[async_trait]
impl Connector for FragileConnector {
    type Session = FragileSession;

    async fn connect(&self, _options: &ConnectOptions) -> Result<FragileSession, BoxError> {
        Ok(FragileSession)
    }
}

// ---------------------------------------------------------------------------
// Session accounting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_checkout_is_matched_by_a_return() {
    let pool = pool(3, 10, Duration::from_secs(2)).await;

    let mut set = JoinSet::new();
    for i in 0..30 {
        let pool = Arc::clone(&pool);
        set.spawn(async move {
            pool.execute_with_collection("posts", move |c| async move {
                c.insert(serde_json::json!({ "_id": i }))
            })
            .await
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.checkouts, 30);
    assert_eq!(stats.returns, 30);
    assert_eq!(stats.succeeded, 30);
    assert_eq!(stats.idle, 3);
    assert_eq!(stats.size, 3);
    assert_eq!(stats.closed_handles, 0);
}

#[tokio::test]
async fn work_error_returns_the_session() {
    let pool = pool(1, 1, Duration::from_secs(1)).await;

    let insert_x = |c: MemoryCollection| async move { c.insert(serde_json::json!({ "_id": "x" })) };
    pool.execute_with_collection("posts", insert_x).await.unwrap();
    let err = pool
        .execute_with_collection("posts", insert_x)
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_work::<MemoryError>(),
        Some(&MemoryError::DuplicateKey {
            collection: "posts".into(),
            id: "\"x\"".into(),
        })
    );
    assert_eq!(pool.idle_handles(), 1);
}

// ---------------------------------------------------------------------------
// Deadlines
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timed_out_call_still_returns_its_session() {
    let pool = pool(1, 1, Duration::from_secs(1)).await;

    let err = pool
        .execute_with_collection("posts", |c| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            c.count()
        })
        .await
        .unwrap_err();

    assert!(
        matches!(&err, Error::OperationTimeout { pool, timeout_ms: 1000 } if pool == "items"),
        "got {err:?}"
    );
    assert!(err.is_retryable());
    assert_eq!(pool.idle_handles(), 0, "work is still running");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.returns, 1);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.succeeded, 1, "abandoned work ran to completion");

    let count = pool
        .execute_with_collection("posts", |c| async move { c.count() })
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test(start_paused = true)]
async fn queueing_time_counts_against_the_deadline() {
    let pool = pool(1, 4, Duration::from_secs(1)).await;

    let blocker = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.execute_with_collection("posts", |c| async move {
                tokio::time::sleep(Duration::from_millis(800)).await;
                c.count()
            })
            .await
        })
    };
    while pool.idle_handles() != 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Waits 800ms in the queue, then needs another 800ms of work.
    let err = pool
        .execute_with_collection("posts", |c| async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            c.count()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OperationTimeout { .. }));
    assert_eq!(blocker.await.unwrap().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Panics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_work_is_reported_and_session_returned() {
    let pool = pool(1, 1, Duration::from_secs(1)).await;

    let err = pool
        .execute_with_collection("posts", |c| async move {
            if c.name() == "posts" {
                panic!("boom");
            }
            c.count()
        })
        .await
        .unwrap_err();

    assert!(
        matches!(&err, Error::Panicked { message, .. } if message == "boom"),
        "got {err:?}"
    );
    assert_eq!(pool.idle_handles(), 1);

    // The single worker survived and the pool keeps serving.
    let count = pool
        .execute_with_collection("posts", |c| async move { c.count() })
        .await
        .unwrap();
    assert_eq!(count, 0);

    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.checkouts, stats.returns);
}

#[tokio::test]
async fn panic_while_building_the_view_is_reported_as_panicked() {
    let options = ConnectOptions::new("mem:27017", "test").with_timeout(Duration::from_secs(1));
    let pool = Pool::connect("fragile", &FragileConnector, &options, 1, 1)
        .await
        .unwrap();

    let err = pool
        .execute_with_collection("bad", |c| async move { Ok::<_, MemoryError>(c) })
        .await
        .unwrap_err();

    assert!(
        matches!(&err, Error::Panicked { message, .. } if message == "no collection named bad"),
        "got {err:?}"
    );
    assert!(!pool.is_closed());
    assert_eq!(pool.idle_handles(), 1);
    assert_eq!(pool.stats().failed, 1);

    let name = pool
        .execute_with_collection("good", |c| async move { Ok::<_, MemoryError>(c) })
        .await
        .unwrap();
    assert_eq!(name, "good");
}

// ---------------------------------------------------------------------------
// Exclusivity
// ---------------------------------------------------------------------------

#[rstest]
#[case::single_worker(1)]
#[case::three_workers(3)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_work_never_exceeds_worker_count(#[case] workers: usize) {
    let pool = pool(workers, 8, Duration::from_secs(10)).await;
    let occupancy = Arc::new(Occupancy::default());

    let mut set = JoinSet::new();
    for _ in 0..24 {
        let pool = Arc::clone(&pool);
        let occupancy = Arc::clone(&occupancy);
        set.spawn(async move {
            pool.execute_with_collection("posts", move |c| async move {
                occupancy.hold(&c, Duration::from_millis(2)).await
            })
            .await
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
    }

    let peak = occupancy.peak.load(Ordering::SeqCst);
    assert!(peak <= workers, "peak {peak} exceeded {workers} workers");
    assert!(peak >= 1);
    assert_eq!(pool.idle_handles(), workers);
}

#[tokio::test(start_paused = true)]
async fn abandoned_work_keeps_its_session_from_the_next_caller() {
    let pool = pool(1, 1, Duration::from_secs(1)).await;
    let occupancy = Arc::new(Occupancy::default());

    let slow = |occupancy: Arc<Occupancy>| {
        move |c: MemoryCollection| async move { occupancy.hold(&c, Duration::from_secs(2)).await }
    };
    let (first, second) = tokio::join!(
        pool.execute_with_collection("posts", slow(Arc::clone(&occupancy))),
        pool.execute_with_collection("posts", slow(Arc::clone(&occupancy))),
    );

    assert!(matches!(first, Err(Error::OperationTimeout { .. })), "got {first:?}");
    assert!(matches!(second, Err(Error::OperationTimeout { .. })), "got {second:?}");

    // Both abandoned calls still run, one after the other.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.timed_out, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.idle, 1);
}

// ---------------------------------------------------------------------------
// Scoped views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn database_and_collection_views_share_the_pool_database() {
    let registry = Registry::new(MemoryConnector::new());
    registry
        .create(
            "mongo",
            Some(ConnectOptions::new("mem:27017", "shop").with_timeout(Duration::from_secs(1))),
            2,
            2,
        )
        .await
        .unwrap();

    registry
        .execute_with_collection("mongo", "orders", |c| async move {
            c.insert(serde_json::json!({ "n": 1 }))
        })
        .await
        .unwrap();

    let (database, names, orders) = registry
        .execute_with_database("MONGO", |db| async move {
            let orders = db.collection("orders").count()?;
            Ok::<_, MemoryError>((db.name().to_owned(), db.collection_names(), orders))
        })
        .await
        .unwrap();

    assert_eq!(database, "shop");
    assert_eq!(names, vec!["orders".to_owned()]);
    assert_eq!(orders, 1);
}
