use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use transfer_client::checksum::{CHECKSUM_HEADER, compute_checksum};
use transfer_client::{
    CompletedPart, Credentials, FailureKind, FileSelection, HttpMetadataService, HttpObjectStore, MetadataService,
    ObjectLocator, ObjectStore, RetryConfig, TransferDirection,
};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn creds() -> Credentials {
    Credentials::new("AK", "SK", "TOKEN")
}

fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_max_attempts(2)
        .with_delays(Duration::from_millis(1), Duration::from_millis(2))
}

#[tokio::test]
async fn test_head_and_ranged_get() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/bucket/dir/a.bin"))
        .and(header("x-session-token", "TOKEN"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 10])
                .insert_header(CHECKSUM_HEADER, "abc"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bucket/dir/a.bin"))
        .and(header("range", "bytes=4-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"456789".to_vec()))
        .mount(&server)
        .await;

    let store = HttpObjectStore::new(&server.uri(), fast_retry()).unwrap();
    let loc: ObjectLocator = "s3://bucket/dir/a.bin".parse().unwrap();

    let head = store.head_object(&loc, &creds()).await.unwrap();
    assert_eq!(head.size, 10);
    assert_eq!(head.checksum.as_deref(), Some("abc"));

    let chunks: Vec<Bytes> = store.get_object(&loc, &creds(), 4).await.unwrap().try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"456789");
}

#[tokio::test]
async fn test_ignored_range_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bucket/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
        .mount(&server)
        .await;

    let store = HttpObjectStore::new(&server.uri(), fast_retry()).unwrap();
    let loc = ObjectLocator::new("bucket", "a.bin");
    assert!(store.get_object(&loc, &creds(), 3).await.is_err());
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/bucket/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bucket/expired"))
        .respond_with(ResponseTemplate::new(403).set_body_string("<Code>ExpiredToken</Code>"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bucket/denied"))
        .respond_with(ResponseTemplate::new(403).set_body_string("<Code>AccessDenied</Code>"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bucket/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = HttpObjectStore::new(&server.uri(), fast_retry()).unwrap();
    let c = creds();

    let err = store.head_object(&ObjectLocator::new("bucket", "missing"), &c).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::NotFound);

    let data = Bytes::from_static(b"x");
    let err = store
        .put_object(&ObjectLocator::new("bucket", "expired"), &c, data.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::ExpiredCredential);

    let err = store
        .put_object(&ObjectLocator::new("bucket", "denied"), &c, data.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Forbidden);

    let err = store
        .put_object(&ObjectLocator::new("bucket", "down"), &c, data)
        .await
        .unwrap_err();
    assert!(err.is_unreachable());

    // One original attempt plus two retries.
    let down_requests = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/bucket/down")
        .count();
    assert_eq!(down_requests, 3);
}

#[tokio::test]
async fn test_multipart_round() {
    let server = MockServer::start().await;
    let part_checksum = compute_checksum(b"part-one");

    Mock::given(method("POST"))
        .and(path("/bucket/big.bin"))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"upload_id": "U1", "initiated": 5})))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bucket/big.bin"))
        .and(query_param("uploadId", "U1"))
        .and(query_param("partNumber", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "part_number": 1, "size": 8, "checksum": part_checksum,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bucket/big.bin"))
        .and(query_param("uploadId", "U1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "parts": [{"part_number": 1, "size": 8, "checksum": part_checksum}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bucket/big.bin"))
        .and(query_param("uploadId", "U1"))
        .and(body_json(serde_json::json!({"parts": [{"part_number": 1, "checksum": part_checksum}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"size": 8})))
        .mount(&server)
        .await;

    let store = HttpObjectStore::new(&server.uri(), fast_retry()).unwrap();
    let loc = ObjectLocator::new("bucket", "big.bin");
    let c = creds();

    let session = store.create_multipart_session(&loc, &c).await.unwrap();
    assert_eq!(session.upload_id, "U1");
    let part = store
        .upload_part(&session, 1, Bytes::from_static(b"part-one"), &c)
        .await
        .unwrap();
    assert_eq!(part.checksum, part_checksum);

    let parts = store.list_parts(&session, &c).await.unwrap();
    assert_eq!(parts, vec![part.clone()]);

    let completed: Vec<CompletedPart> = parts.iter().map(CompletedPart::from).collect();
    let head = store.complete_multipart_session(&session, &completed, &c).await.unwrap();
    assert_eq!(head.size, 8);
}

#[tokio::test]
async fn test_metadata_service_listing_and_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/files/query"))
        .and(header("authorization", "Bearer secret-api-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "files": [{
                "file_id": "17",
                "alias": "sub/x.txt",
                "expected_size": 3,
                "locator": "s3://bucket/sub/x.txt",
            }],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/credentials"))
        .and(body_json(serde_json::json!({"file_ids": ["17"], "direction": "download"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "credentials": {"17": {
                "access_key_id": "AK", "secret_access_key": "SK", "session_token": "T",
            }},
        })))
        .mount(&server)
        .await;

    let svc = HttpMetadataService::new(
        &format!("{}/api", server.uri()),
        Some("secret-api-token".to_owned()),
        fast_retry(),
    )
    .unwrap();

    let files = svc.list_all_files(&FileSelection::Collection("9".into())).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].locator, ObjectLocator::new("bucket", "sub/x.txt"));

    let issued = svc
        .issue_credentials(&["17".to_owned()], TransferDirection::Download)
        .await
        .unwrap();
    assert_eq!(issued["17"].session_token, "T");
}

#[tokio::test]
async fn test_unreachable_metadata_service() {
    // Nothing listens on this port.
    let svc = HttpMetadataService::new("http://127.0.0.1:9/", None, RetryConfig::no_retry()).unwrap();
    let err = svc
        .issue_credentials(&["1".to_owned()], TransferDirection::Download)
        .await
        .unwrap_err();
    assert!(err.is_unreachable(), "{err:?}");
}
