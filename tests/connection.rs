//! Single-connection behavior against the mock server.

mod common;

use common::MockServer;
use zero_mysql::Error;
use zero_mysql::tokio::Connection;

async fn connect(server: &MockServer) -> Connection {
    Connection::connect_with(&server.opts(), server).await.unwrap()
}

#[tokio::test]
async fn test_malformed_packet_fails_pending_operations() {
    let server = MockServer::new();
    let conn = connect(&server).await;

    // The second query waits for the first one's response
    let (first, second) = tokio::join!(conn.query("BAD COLUMN"), conn.query("SELECT 1"));
    assert!(matches!(first, Err(Error::Protocol(_))));
    assert!(matches!(second, Err(Error::Protocol(_))));
    assert!(!conn.is_alive());

    assert!(matches!(conn.ping().await, Err(Error::Protocol(_))));
    assert!(!server.queries().contains(&"SELECT 1".to_string()));
}

#[tokio::test]
async fn test_multiple_result_sets() {
    let server = MockServer::new();
    let conn = connect(&server).await;

    let mut stream = conn.query("MULTI").await.unwrap();
    let row = stream.next_row().await.unwrap().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 1);
    assert!(stream.next_row().await.unwrap().is_none());
    assert!(stream.outcome().unwrap().has_more_results());
    assert!(!stream.is_complete());

    assert!(stream.next_result_set().await.unwrap());
    let row = stream.next_row().await.unwrap().unwrap();
    assert_eq!(row.get_by_name::<String>("v").unwrap(), "two");
    assert!(stream.next_row().await.unwrap().is_none());
    assert!(stream.is_complete());
    assert!(!stream.next_result_set().await.unwrap());
    drop(stream);

    // The connection is free again once both sets are read
    conn.ping().await.unwrap();
    assert!(conn.is_alive());
}

#[tokio::test]
async fn test_drain_skips_remaining_result_sets() {
    let server = MockServer::new();
    let conn = connect(&server).await;

    let outcome = conn.query_drop("MULTI").await.unwrap();
    assert!(!outcome.has_more_results());
    let row: Option<(i64,)> = conn.query_first("SELECT 8").await.unwrap();
    assert_eq!(row, Some((8,)));
}
