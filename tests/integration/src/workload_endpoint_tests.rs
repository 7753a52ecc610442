//! Attested Unix socket connections feeding JWT-SVID validation.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use trustbind_core::TrustDomain;
use trustbind_identity::{
    JwtPublicKey, JwtSvidError, JwtSvidValidator, KeyStore, KeyStoreHandle, TrustDomainKeyStore,
};
use trustbind_peertracker::{AttestedListener, PeerTrackerConfig, ProcessTracker};

use crate::test_utils::*;

fn example_keys() -> TrustDomainKeyStore {
    TrustDomainKeyStore::new().with_key(
        TrustDomain::new("example.org").unwrap(),
        "k1",
        JwtPublicKey::from_public_key_pem(JWT_EC_PUB).unwrap(),
    )
}

fn listener(dir: &tempfile::TempDir) -> AttestedListener {
    let tracker = Arc::new(ProcessTracker::with_procfs(PeerTrackerConfig::default()).unwrap());
    AttestedListener::bind(dir.path().join("api.sock"), tracker).unwrap()
}

/// Accept one connection, validate every token line it sends and answer
/// with the SPIFFE ID or the error.
async fn serve_one(listener: AttestedListener, keys: Arc<KeyStoreHandle>) -> i32 {
    let stream = listener.accept().await.unwrap();
    let pid = stream.caller().pid();
    let (stream, caller) = stream.into_parts();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let validator = JwtSvidValidator::default();

    while let Some(token) = lines.next_line().await.unwrap() {
        caller.check().unwrap();
        let reply = match validator.validate(&token, &*keys, &["bar"]) {
            Ok(identity) => json!({ "spiffe_id": identity.spiffe_id().to_string() }),
            Err(JwtSvidError::KeyNotFound { kid, .. }) => json!({ "error": "key_not_found", "kid": kid }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        writer
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();
    }
    pid
}

async fn roundtrip(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    token: &str,
) -> Value {
    writer.write_all(format!("{token}\n").as_bytes()).await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    serde_json::from_str(&reply).unwrap()
}

#[tokio::test]
async fn test_attested_caller_validates_token() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let listener = listener(&dir);
    let path = listener.local_path().unwrap().to_path_buf();
    let keys = Arc::new(KeyStoreHandle::with_keys(example_keys()));
    let server = tokio::spawn(serve_one(listener, Arc::clone(&keys)));

    let (reader, mut writer) = UnixStream::connect(&path).await.unwrap().into_split();
    let mut lines = BufReader::new(reader).lines();

    let token = es256_token("k1", &svid_claims("spiffe://example.org/blog", &["bar"]));
    let reply = roundtrip(&mut lines, &mut writer, &token).await;
    assert_eq!(reply["spiffe_id"], "spiffe://example.org/blog");

    let wrong_audience = es256_token("k1", &svid_claims("spiffe://example.org/blog", &["baz"]));
    let reply = roundtrip(&mut lines, &mut writer, &wrong_audience).await;
    assert!(reply["error"].as_str().unwrap().contains("audience"));

    drop(writer);
    let pid = server.await.unwrap();
    assert_eq!(pid, std::process::id() as i32);
}

#[tokio::test]
async fn test_key_refresh_applies_to_next_request() {
    let dir = tempfile::tempdir().unwrap();
    let listener = listener(&dir);
    let path = listener.local_path().unwrap().to_path_buf();
    let keys = Arc::new(KeyStoreHandle::with_keys(example_keys()));
    let server = tokio::spawn(serve_one(listener, Arc::clone(&keys)));

    let (reader, mut writer) = UnixStream::connect(&path).await.unwrap().into_split();
    let mut lines = BufReader::new(reader).lines();
    let token = es256_token("k1", &svid_claims("spiffe://example.org/blog", &["bar"]));

    let before = keys.snapshot().unwrap();
    let reply = roundtrip(&mut lines, &mut writer, &token).await;
    assert_eq!(reply["spiffe_id"], "spiffe://example.org/blog");

    // Rotate to a key set that only knows k1 under another trust domain
    keys.refresh(TrustDomainKeyStore::new().with_key(
        TrustDomain::new("other.org").unwrap(),
        "k1",
        JwtPublicKey::from_public_key_pem(JWT_EC_PUB).unwrap(),
    ));
    let reply = roundtrip(&mut lines, &mut writer, &token).await;
    assert_eq!(reply["error"], "key_not_found");
    assert_eq!(reply["kid"], "k1");

    // A reader holding the previous snapshot is unaffected
    assert!(before
        .find_public_key(&TrustDomain::new("example.org").unwrap(), "k1")
        .is_ok());

    drop(writer);
    server.await.unwrap();
}
