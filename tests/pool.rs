//! Connection pool behavior against the mock server.

mod common;

use std::time::Duration;

use common::{Command, MockServer, MockValue};
use zero_mysql::{Error, IsolationLevel};
use zero_mysql::tokio::Pool;

fn pool(server: &MockServer, limit: usize) -> Pool {
    let mut opts = server.opts();
    opts.pool_max_conn = limit;
    Pool::with_connector(opts, server.clone()).unwrap()
}

#[tokio::test]
async fn test_sequential_queries_in_order() {
    let server = MockServer::new();
    let pool = pool(&server, 2);

    let mut seen = Vec::new();
    for i in 0..6 {
        let row: Option<(i64,)> = pool.query_first(&format!("SELECT {i}")).await.unwrap();
        seen.push(row.unwrap().0);
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    assert!(pool.live_count() <= 2);
    assert_eq!(pool.idle_count(), pool.live_count());
}

#[tokio::test]
async fn test_connections_created_lazily() {
    let server = MockServer::new();
    let pool = pool(&server, 4);
    assert_eq!(server.connects(), 0);
    assert_eq!(pool.live_count(), 0);

    pool.query_drop("DO 1").await.unwrap();
    assert_eq!(server.connects(), 1);
    assert_eq!(pool.connection_limit(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limit_never_exceeded() {
    let server = MockServer::new();
    let pool = pool(&server, 3);

    let mut tasks = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.get().await.unwrap();
            assert!(pool.live_count() + pool.extracted_count() <= 3);
            let row: Option<(i64,)> = conn.query_first(&format!("SELECT {i}")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            row.unwrap().0
        }));
    }
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results.sort_unstable();
    assert_eq!(results, (0..12).collect::<Vec<i64>>());
    assert!(server.max_open_connections() <= 3);
    assert!(server.connects() <= 3);
}

#[tokio::test]
async fn test_extract_connection() {
    let server = MockServer::new();
    let pool = pool(&server, 2);

    let first = pool.extract_connection().await.unwrap();
    assert_eq!(pool.extracted_count(), 1);
    assert_eq!(pool.live_count(), 0);

    // The extracted connection is outside the rotation but still usable
    let row: Option<(i64,)> = first.query_first("SELECT 7").await.unwrap();
    assert_eq!(row, Some((7,)));

    // Pool creates a new connection for its own work
    pool.query_drop("DO 1").await.unwrap();
    assert_eq!(pool.live_count(), 1);

    let second = pool.extract_connection().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(pool.extracted_count(), 2);
    assert_eq!(pool.live_count(), 0);

    // Both slots are taken by extracted connections
    assert!(
        tokio::time::timeout(Duration::from_millis(50), pool.get())
            .await
            .is_err()
    );

    first.close().await.unwrap();
    assert!(!first.is_alive());
    assert_eq!(pool.extracted_count(), 1);
    let conn = tokio::time::timeout(Duration::from_secs(1), pool.get())
        .await
        .unwrap()
        .unwrap();
    assert!(conn.is_alive());
}

#[tokio::test]
async fn test_dead_connection_replaced() {
    let server = MockServer::new();
    let pool = pool(&server, 1);

    let conn = pool.get().await.unwrap();
    conn.engine().close();
    drop(conn);

    let row: Option<(i64,)> = pool.query_first("SELECT 5").await.unwrap();
    assert_eq!(row, Some((5,)));
    assert_eq!(server.connects(), 2);
}

#[tokio::test]
async fn test_waiter_gets_returned_connection() {
    let server = MockServer::new();
    let pool = pool(&server, 1);

    let held = pool.get().await.unwrap();
    let p = pool.clone();
    let waiter = tokio::spawn(async move { p.query_first::<(i64,)>("SELECT 3").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), Some((3,)));
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_server_error_keeps_connection() {
    let server = MockServer::new();
    let pool = pool(&server, 1);

    let err = pool.query_drop("FAIL now").await.unwrap_err();
    assert_eq!(err.server_code(), Some(1064));
    assert!(!err.is_connection_broken());

    pool.query_drop("DO 1").await.unwrap();
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_close_pool() {
    let server = MockServer::new();
    let pool = pool(&server, 2);
    pool.query_drop("DO 1").await.unwrap();

    pool.close().await;
    assert!(pool.is_closed());
    assert!(matches!(pool.query("SELECT 1").await, Err(Error::PoolClosed)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(
        server
            .commands()
            .iter()
            .any(|(_, c)| *c == Command::Quit)
    );
}

/// Leave the pool with one idle connection whose server side has hung up.
async fn lose_idle_connection(server: &MockServer, pool: &Pool) {
    pool.query_drop("HANGUP").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(server.open_connections(), 0);
}

#[tokio::test]
async fn test_query_replaces_connection_lost_while_idle() {
    let server = MockServer::new();
    let pool = pool(&server, 1);
    lose_idle_connection(&server, &pool).await;

    let row: Option<(i64,)> = pool.query_first("SELECT 5").await.unwrap();
    assert_eq!(row, Some((5,)));
    assert_eq!(server.connects(), 2);
    assert_eq!(pool.live_count(), 1);
}

#[tokio::test]
async fn test_statement_replaces_connection_lost_while_idle() {
    let server = MockServer::new();
    let pool = pool(&server, 1);
    let stmt = pool.prepare("INSERT INTO t VALUES (?)").await.unwrap();
    lose_idle_connection(&server, &pool).await;

    stmt.exec_drop((1,)).await.unwrap();
    assert_eq!(server.connects(), 2);
    assert_eq!(server.executions(), vec![vec![MockValue::Int(1)]]);
}

#[tokio::test]
async fn test_transaction_replaces_connection_lost_while_idle() {
    let server = MockServer::new();
    let pool = pool(&server, 1);
    lose_idle_connection(&server, &pool).await;

    let tx = pool
        .begin_transaction(IsolationLevel::default())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(server.connects(), 2);
    assert!(server.queries().contains(&"START TRANSACTION".to_string()));
}

#[tokio::test]
async fn test_idle_connections_reaped_after_timeout() {
    let server = MockServer::new();
    let mut opts = server.opts();
    opts.pool_max_conn = 2;
    opts.pool_idle_timeout = Some(Duration::from_millis(50));
    let pool = Pool::with_connector(opts, server.clone()).unwrap();

    pool.query_drop("DO 1").await.unwrap();
    assert_eq!(pool.idle_count(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.live_count(), 0);
    assert!(
        server
            .commands()
            .iter()
            .any(|(_, c)| *c == Command::Quit)
    );

    // The pool still serves requests with a new connection
    pool.query_drop("DO 2").await.unwrap();
    assert_eq!(server.connects(), 2);
}
