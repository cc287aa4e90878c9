//! Shared scaffolding for the protocol tests.
//!
//! Each test boots a node against a scratch base directory and an
//! in-memory metadata service, then drives the real router directly.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode};
use axum::Router;
use axum_extra::headers::{Authorization, HeaderMapExt};
use cairn_core::{merkle_root, sha256_hex, Digest, RootHash, StoreId};
use cairn_store::blob_rel_path;
use ed25519_dalek::{Signer, SigningKey};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use crate::config::{Config, OwnerCredentials};
use crate::context::Context;
use crate::http::api::{X_KEY_OWNERSHIP_SIG, X_NONCE, X_PUBLIC_KEY};
use crate::http::build_router;
use crate::http::AppState;
use crate::meta::MemoryMeta;

pub const OWNER_USER: &str = "publisher";
pub const OWNER_PASS: &str = "propagate";

pub fn test_store_id() -> StoreId {
    "a".repeat(64).parse().unwrap()
}

pub struct TestNode {
    pub state: AppState,
    pub router: Router,
    pub meta: Arc<MemoryMeta>,
    pub signing: SigningKey,
    _base: TempDir,
}

impl TestNode {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(customize: impl FnOnce(&mut Config)) -> Self {
        let base = tempfile::tempdir().expect("test base dir");
        let mut config = Config {
            base_dir: base.path().to_path_buf(),
            store_owner: Some(OwnerCredentials {
                username: OWNER_USER.to_string(),
                password: OWNER_PASS.to_string(),
            }),
            ..Config::default()
        };
        customize(&mut config);

        let meta = Arc::new(MemoryMeta::new());
        let context = Context::build(config, meta.clone())
            .await
            .expect("building test context");
        let state = context.state().clone();
        let router = build_router(state.clone());

        Self {
            state,
            router,
            meta,
            signing: SigningKey::from_bytes(&[7u8; 32]),
            _base: base,
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    pub fn sign_nonce(&self, nonce: &str) -> String {
        hex::encode(self.signing.sign(nonce.as_bytes()).to_bytes())
    }

    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router never errors")
    }

    /// `POST /upload/{store}` with the snapshot's `.dat` as multipart body.
    pub async fn start_session(
        &self,
        store_id: &StoreId,
        snapshot: &Snapshot,
        with_auth: bool,
    ) -> Response<Body> {
        let (content_type, body) = multipart_dat(&snapshot.root, &snapshot.dat);
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(format!("/upload/{store_id}"))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        if with_auth {
            request
                .headers_mut()
                .typed_insert(Authorization::basic(OWNER_USER, OWNER_PASS));
        }
        self.request(request).await
    }

    pub async fn start_session_ok(&self, store_id: &StoreId, snapshot: &Snapshot) -> Uuid {
        let with_auth = !self.state.store.store_exists(store_id).await;
        let response = self.start_session(store_id, snapshot, with_auth).await;
        assert_eq!(response.status(), StatusCode::OK, "start session failed");
        let body = json_body(response).await;
        body["sessionId"]
            .as_str()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .expect("response carries a session id")
    }

    pub async fn head_nonce(
        &self,
        store_id: &StoreId,
        session_id: &Uuid,
        path: &str,
    ) -> Response<Body> {
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(format!("/upload/{store_id}/{session_id}/{path}"))
            .body(Body::empty())
            .unwrap();
        self.request(request).await
    }

    /// HEAD for a nonce, asserting the file is not yet present.
    pub async fn issue_nonce_ok(
        &self,
        store_id: &StoreId,
        session_id: &Uuid,
        path: &str,
    ) -> String {
        let response = self.head_nonce(store_id, session_id, path).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "x-file-exists"), Some("false"));
        header_str(&response, "x-nonce")
            .expect("nonce issued for absent file")
            .to_string()
    }

    pub async fn put_file(
        &self,
        store_id: &StoreId,
        session_id: &Uuid,
        path: &str,
        content: &[u8],
        nonce: &str,
    ) -> Response<Body> {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("/upload/{store_id}/{session_id}/{path}"))
            .header(X_NONCE, nonce)
            .header(X_PUBLIC_KEY, self.public_key_hex())
            .header(X_KEY_OWNERSHIP_SIG, self.sign_nonce(nonce))
            .body(Body::from(content.to_vec()))
            .unwrap();
        self.request(request).await
    }

    /// Nonce, signature and upload for one file, asserting success.
    pub async fn upload_file_ok(
        &self,
        store_id: &StoreId,
        session_id: &Uuid,
        path: &str,
        content: &[u8],
    ) {
        let nonce = self.issue_nonce_ok(store_id, session_id, path).await;
        let response = self
            .put_file(store_id, session_id, path, content, &nonce)
            .await;
        assert_eq!(response.status(), StatusCode::OK, "file upload failed");
    }

    pub async fn commit(&self, store_id: &StoreId, session_id: &Uuid) -> Response<Body> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/commit/{store_id}/{session_id}"))
            .body(Body::empty())
            .unwrap();
        self.request(request).await
    }

    pub async fn abort(&self, store_id: &StoreId, session_id: &Uuid) -> Response<Body> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/abort/{store_id}/{session_id}"))
            .body(Body::empty())
            .unwrap();
        self.request(request).await
    }

    pub async fn fetch(&self, store_id: &StoreId, path: &str) -> Response<Body> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("/fetch/{store_id}/{path}"))
            .body(Body::empty())
            .unwrap();
        self.request(request).await
    }

    /// Registers the test writer and the snapshot root, then runs the whole
    /// start → upload → commit flow.
    pub async fn publish_snapshot(&self, store_id: &StoreId, snapshot: &Snapshot) {
        self.meta.publish_root(store_id, &snapshot.root);
        self.meta.allow_writer(store_id, &self.public_key_hex());

        let session_id = self.start_session_ok(store_id, snapshot).await;
        for (path, content) in &snapshot.files {
            self.upload_file_ok(store_id, &session_id, path, content)
                .await;
        }
        let response = self.commit(store_id, &session_id).await;
        assert_eq!(response.status(), StatusCode::OK, "commit failed");
    }
}

/// A snapshot whose Merkle leaves are the content digests of its blobs.
pub struct Snapshot {
    pub root: RootHash,
    pub dat: Vec<u8>,
    /// `(data path, uncompressed content)` pairs.
    pub files: Vec<(String, Vec<u8>)>,
}

pub fn snapshot_of(contents: &[&[u8]]) -> Snapshot {
    let digests: Vec<Digest> = contents.iter().map(|bytes| sha256_hex(bytes)).collect();
    let root = merkle_root(&digests);

    let files: serde_json::Map<String, serde_json::Value> = digests
        .iter()
        .enumerate()
        .map(|(index, digest)| {
            (
                format!("{index:02x}"),
                serde_json::json!({ "hash": digest.as_str(), "sha256": digest.as_str() }),
            )
        })
        .collect();
    let dat = serde_json::to_vec(&serde_json::json!({
        "root": root.as_str(),
        "leaves": digests.iter().map(|digest| digest.as_str()).collect::<Vec<_>>(),
        "files": files,
    }))
    .unwrap();

    let files = contents
        .iter()
        .zip(&digests)
        .map(|(bytes, digest)| {
            (
                blob_rel_path(digest).to_string_lossy().into_owned(),
                bytes.to_vec(),
            )
        })
        .collect();

    Snapshot { root, dat, files }
}

const BOUNDARY: &str = "cairn-test-boundary";

pub fn multipart_dat(root: &RootHash, dat: &[u8]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{root}.dat\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(dat);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}

pub fn header_str<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("collecting body")
        .to_bytes()
        .to_vec()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("body is JSON")
}
