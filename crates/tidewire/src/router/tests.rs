//! Unit tests for request correlation

use super::*;
use serde_json::json;
use tidewire_proto::{ErrorBody, ErrorCode};
use tidewire_transport::TransportError;

#[tokio::test]
async fn test_success_resolves_caller() {
    let router = Router::new();
    let id = Uuid::new_v4();
    let rx = router.register(id, None);
    assert_eq!(router.len(), 1);

    assert!(router.complete(Response::success(id, json!("hi"))));
    assert_eq!(rx.await.unwrap().unwrap(), json!("hi"));
    assert!(router.is_empty());
}

#[tokio::test]
async fn test_error_response_rejects_caller() {
    let router = Router::new();
    let id = Uuid::new_v4();
    let rx = router.register(id, None);

    let body = ErrorBody::new(ErrorCode::InternalError, "boom").with_stack("boom\n  at handler");
    router.complete(Response::error(id, body));

    match rx.await.unwrap() {
        Err(ClientError::Remote(remote)) => {
            assert_eq!(remote.code, ErrorCode::InternalError);
            assert_eq!(remote.message, "boom");
            assert_eq!(remote.stack.as_deref(), Some("boom\n  at handler"));
        }
        other => panic!("Expected remote error, got {:?}", other),
    }
}

#[test]
fn test_unknown_response_ignored() {
    let router = Router::new();
    assert!(!router.complete(Response::success(Uuid::new_v4(), json!(null))));
    assert!(!router.progress(Uuid::new_v4(), Direction::Upload, 1, 2));
}

#[tokio::test]
async fn test_progress_callback() {
    let router = Router::new();
    let id = Uuid::new_v4();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _rx = router.register(id, Some(Arc::new(move |p: TransferProgress| sink.lock().push(p))));

    assert!(router.progress(id, Direction::Upload, 10, 30));
    assert!(router.progress(id, Direction::Download, 20, 30));

    assert_eq!(
        *seen.lock(),
        vec![
            TransferProgress { direction: Direction::Upload, received: 10, total: 30 },
            TransferProgress { direction: Direction::Download, received: 20, total: 30 },
        ]
    );
}

#[tokio::test]
async fn test_reject_all_fails_every_caller() {
    let router = Router::new();
    let receivers: Vec<_> = (0..3).map(|_| router.register(Uuid::new_v4(), None)).collect();

    assert_eq!(router.reject_all(|| ClientError::Transport(TransportError::Closed)), 3);
    assert!(router.is_empty());

    for rx in receivers {
        assert!(rx.await.unwrap().unwrap_err().is_transport());
    }
}

#[tokio::test]
async fn test_dropped_caller_does_not_panic() {
    let router = Router::new();
    let id = Uuid::new_v4();
    drop(router.register(id, None));

    assert!(router.fail(id, ClientError::Closed));
    assert!(!router.remove(id));
}
