//! The upload protocol engine and fetch surface.
//!
//! TLS termination and transport concerns live in the listener; handlers
//! here implement session and content semantics only. Bodies are consumed
//! as streams throughout, never buffered whole.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{ConnectInfo, Multipart, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use cairn_core::{verify_key_ownership_signature, RootCommitment, RootHash, StoreId};
use cairn_store::{blob_rel_path, sanitize_rel_path, BlobSink, Store};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OwnerCredentials;
use crate::http::auth::check_store_owner;
use crate::http::error::ApiError;
use crate::http::rate_limit::RateLimiter;
use crate::meta::MetaService;
use crate::nonce::{nonce_key, NonceCache};
use crate::ownership::OwnerCache;
use crate::session::{staged_file_exists, Session, SessionRegistry};

pub const X_STORE_EXISTS: &str = "x-store-exists";
pub const X_HAS_ROOT_HASH: &str = "x-has-root-hash";
pub const X_FILE_EXISTS: &str = "x-file-exists";
pub const X_FILE_SIZE: &str = "x-file-size";
pub const X_NONCE: &str = "x-nonce";
pub const X_PUBLIC_KEY: &str = "x-public-key";
pub const X_KEY_OWNERSHIP_SIG: &str = "x-key-ownership-sig";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sessions: SessionRegistry,
    pub nonces: Arc<NonceCache>,
    pub owners: Arc<OwnerCache>,
    pub meta: Arc<dyn MetaService>,
    pub store_owner: Option<OwnerCredentials>,
    pub upload_limiter: Arc<RateLimiter>,
    pub fetch_limiter: Arc<RateLimiter>,
}

#[derive(Serialize)]
pub struct StartUploadResponse {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
}

#[derive(Serialize)]
pub struct UploadFileResponse {
    pub sha256: String,
    pub size: u64,
}

#[derive(Serialize)]
pub struct CommitResponse {
    pub copied: usize,
    pub deduplicated: usize,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "running" })
}

#[derive(Deserialize)]
pub struct ProbeStoreQuery {
    #[serde(rename = "hasRootHash")]
    has_root_hash: Option<String>,
}

/// `HEAD /{storeId}` — existence probe for a store and optionally one of
/// its root commitments.
pub async fn probe_store(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
    Query(query): Query<ProbeStoreQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let store_id = parse_store_id(&store_id)?;
    let exists = state.store.store_exists(&store_id).await;

    let mut headers = HeaderMap::new();
    headers.insert(X_STORE_EXISTS, bool_header(exists));
    if let Some(raw) = query.has_root_hash {
        let root: RootHash = raw
            .parse()
            .map_err(|_| ApiError::BadRequest("hasRootHash must be 64 hex characters".into()))?;
        let has_root = exists && state.store.has_commitment(&store_id, &root).await;
        headers.insert(X_HAS_ROOT_HASH, bool_header(has_root));
    }
    Ok((StatusCode::OK, headers, ()))
}

/// `POST /upload/{storeId}` — open an upload session.
///
/// The multipart body carries a single `<rootHash>.dat` part. Creating a
/// store that does not exist yet additionally requires the configured
/// owner credentials.
pub async fn start_upload(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(store_id): Path<String>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    mut multipart: Multipart,
) -> Result<Json<StartUploadResponse>, ApiError> {
    if !state.upload_limiter.check(&client_key(connect_info.as_ref())) {
        return Err(ApiError::RateLimited);
    }
    let store_id = parse_store_id(&store_id)?;

    if !state.store.store_exists(&store_id).await {
        check_store_owner(auth.as_ref().map(|header| &header.0), state.store_owner.as_ref())?;
    }

    let field = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid multipart body: {err}")))?
        .ok_or_else(|| ApiError::BadRequest("missing root commitment file".into()))?;
    let file_name = field
        .file_name()
        .ok_or_else(|| ApiError::BadRequest("commitment part carries no filename".into()))?;
    let root: RootHash = file_name
        .strip_suffix(".dat")
        .ok_or_else(|| {
            ApiError::BadRequest("commitment file must be named <rootHash>.dat".into())
        })?
        .parse()
        .map_err(|_| ApiError::BadRequest("root hash must be 64 hex characters".into()))?;

    if state.store.has_commitment(&store_id, &root).await {
        return Err(ApiError::Conflict(format!(
            "root {root} is already committed to store {store_id}"
        )));
    }

    let session = state.sessions.create(store_id).await?;
    match ingest_commitment(&state, &session, field, &root).await {
        Ok(()) => {
            info!(session = %session.id(), root = %root, "upload session started");
            Ok(Json(StartUploadResponse {
                session_id: session.id(),
            }))
        }
        Err(err) => {
            state.sessions.destroy(&session.id()).await;
            Err(err)
        }
    }
}

/// Streams the `.dat` part into the staging area and validates it as this
/// session's root commitment.
async fn ingest_commitment(
    state: &AppState,
    session: &Session,
    mut field: Field<'_>,
    root: &RootHash,
) -> Result<(), ApiError> {
    let staging = state.sessions.staging_dir(session);
    let dat_path = staging.join(format!("{root}.dat"));

    let sink = BlobSink::create(dat_path.clone(), false);
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ApiError::BadRequest(format!("commitment stream failed: {err}")))?
    {
        session.bump();
        sink.write(chunk).await?;
    }
    sink.finish().await?;

    let bytes = tokio::fs::read(&dat_path)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    let commitment = RootCommitment::parse(&bytes, root)?;

    // The network is the authority on which roots a store has published.
    // The service may serve a cached answer that lags the publication, so
    // an unknown root gets one cache-busting retry before rejection.
    let store_id = session.store_id();
    let mut history = state
        .meta
        .root_history(store_id, false)
        .await
        .map_err(ApiError::Internal)?;
    if !history.contains(root) {
        history = state
            .meta
            .root_history(store_id, true)
            .await
            .map_err(ApiError::Internal)?;
    }
    if !history.contains(root) {
        return Err(ApiError::BadRequest(format!(
            "root {root} is not in the root history of store {store_id}"
        )));
    }

    session.set_commitment(Arc::new(commitment));
    Ok(())
}

/// `HEAD /upload/{storeId}/{sessionId}/{filename}` — report whether the
/// file already exists and otherwise issue a one-time upload nonce.
pub async fn issue_nonce(
    State(state): State<AppState>,
    Path((store_id, session_id, filename)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let store_id = parse_store_id(&store_id)?;
    let session_id = parse_session_id(&session_id)?;
    let session = lookup_session(&state, &store_id, &session_id)?;
    let rel = sanitize_rel_path(&filename)?;

    let staging = state.sessions.staging_dir(&session);
    let exists = staged_file_exists(&staging, &rel).await
        || state.store.file_size(&store_id, &rel).await.is_some();

    let mut headers = HeaderMap::new();
    headers.insert(X_FILE_EXISTS, bool_header(exists));
    if !exists {
        let nonce = state
            .nonces
            .issue(nonce_key(&store_id, &session_id, &filename));
        headers.insert(X_NONCE, HeaderValue::from_str(&nonce).expect("nonce is hex"));
    }
    Ok((StatusCode::OK, headers, ()))
}

/// `PUT /upload/{storeId}/{sessionId}/{filename}` — stream one file into
/// the session's staging area.
///
/// Checks run in a fixed order: required headers, nonce, signature,
/// session, write permission. The body then streams through the hashing
/// sink (gzip for `data/` paths) and, for `data/` paths, the finished blob
/// must prove Merkle membership under the session's commitment or the
/// session dies.
pub async fn upload_file(
    State(state): State<AppState>,
    Path((store_id, session_id, filename)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadFileResponse>, ApiError> {
    let nonce = required_header(&headers, X_NONCE)?;
    let public_key = required_header(&headers, X_PUBLIC_KEY)?;
    let signature = required_header(&headers, X_KEY_OWNERSHIP_SIG)?;

    let store_id = parse_store_id(&store_id)?;
    let session_id = parse_session_id(&session_id)?;

    if !state
        .nonces
        .validate_and_consume(&nonce_key(&store_id, &session_id, &filename), &nonce)
    {
        return Err(ApiError::Unauthorized("invalid or expired nonce".into()));
    }

    match verify_key_ownership_signature(&nonce, &signature, &public_key) {
        Ok(true) => {}
        _ => {
            return Err(ApiError::Unauthorized(
                "invalid key ownership signature".into(),
            ));
        }
    }

    let session = lookup_session(&state, &store_id, &session_id)?;

    if !state
        .owners
        .is_owner(&store_id, &public_key)
        .await
        .map_err(ApiError::Internal)?
    {
        return Err(ApiError::Forbidden(format!(
            "key is not an authorized writer for store {store_id}"
        )));
    }

    let rel = sanitize_rel_path(&filename)?;
    let compress = filename.starts_with("data/");
    let dest = state.sessions.staging_dir(&session).join(&rel);

    let sink = BlobSink::create(dest, compress);
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| ApiError::BadRequest(format!("upload stream failed: {err}")))?;
        session.bump();
        state.owners.touch(&store_id, &public_key);
        sink.write(chunk).await?;
    }
    let outcome = sink.finish().await?;

    if compress {
        let Some(commitment) = session.commitment() else {
            state.sessions.destroy(&session_id).await;
            return Err(ApiError::BadRequest(
                "session has no accepted root commitment".into(),
            ));
        };
        if let Err(err) = commitment.verify_file(&filename, &outcome.digest) {
            warn!(session = %session_id, file = %filename, %err, "integrity check failed");
            state.sessions.destroy(&session_id).await;
            return Err(err.into());
        }
    }

    // An expiry racing the upload may have reclaimed the staging area; the
    // bytes just written are gone and the client must restart.
    if state.sessions.get(&session_id).is_none() {
        return Err(ApiError::NotFound("session expired during upload".into()));
    }

    Ok(Json(UploadFileResponse {
        sha256: outcome.digest.to_string(),
        size: outcome.bytes_in,
    }))
}

/// `POST /commit/{storeId}/{sessionId}` — publish the staged snapshot.
///
/// Taking the session out of the registry disarms its expiry timer, so at
/// most one of commit and timeout ever operates on the staging area. The
/// session is consumed whether the commit succeeds or not.
pub async fn commit_session(
    State(state): State<AppState>,
    Path((store_id, session_id)): Path<(String, String)>,
) -> Result<Json<CommitResponse>, ApiError> {
    let store_id = parse_store_id(&store_id)?;
    let session_id = parse_session_id(&session_id)?;
    lookup_session(&state, &store_id, &session_id)?;

    let Some(session) = state.sessions.take(&session_id) else {
        return Err(ApiError::NotFound(format!("unknown session {session_id}")));
    };
    let result = finalize_commit(&state, &session).await;
    state.sessions.reclaim_staging(&session).await;
    result
}

async fn finalize_commit(
    state: &AppState,
    session: &Session,
) -> Result<Json<CommitResponse>, ApiError> {
    let store_id = session.store_id();
    let staging = state.sessions.staging_dir(session);

    let Some(commitment) = session.commitment() else {
        return Err(ApiError::BadRequest(
            "session has no accepted root commitment".into(),
        ));
    };
    let root = commitment.root();
    let dat_name = format!("{root}.dat");
    if !staged_file_exists(&staging, FsPath::new(&dat_name)).await {
        return Err(ApiError::BadRequest(format!(
            "commitment file {dat_name} is missing from the session"
        )));
    }

    // Every declared blob must be either staged or already committed;
    // partial re-uploads of a changed delta are expected.
    for (key, entry) in commitment.files() {
        let rel = blob_rel_path(&entry.sha256);
        let staged = staged_file_exists(&staging, &rel).await;
        let committed = state.store.file_size(store_id, &rel).await.is_some();
        if !staged && !committed {
            return Err(ApiError::BadRequest(format!(
                "snapshot file {key} ({}) was never uploaded",
                entry.sha256
            )));
        }
    }

    let outcome = state
        .store
        .merge_session(store_id, &staging)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;

    if let Err(err) = state.meta.store_created(store_id).await {
        warn!(store = %store_id, %err, "could not record store creation height");
    }
    regenerate_manifest(state, store_id).await;

    info!(
        store = %store_id,
        root = %root,
        copied = outcome.copied,
        deduplicated = outcome.deduplicated,
        "snapshot committed"
    );
    Ok(Json(CommitResponse {
        copied: outcome.copied,
        deduplicated: outcome.deduplicated,
    }))
}

/// `POST /abort/{storeId}/{sessionId}` — discard a pending session.
pub async fn abort_session(
    State(state): State<AppState>,
    Path((store_id, session_id)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    let store_id = parse_store_id(&store_id)?;
    let session_id = parse_session_id(&session_id)?;
    lookup_session(&state, &store_id, &session_id)?;

    if !state.sessions.destroy(&session_id).await {
        return Err(ApiError::NotFound(format!("unknown session {session_id}")));
    }
    regenerate_manifest(&state, &store_id).await;
    Ok(Json(MessageResponse {
        message: "upload aborted".into(),
    }))
}

/// `HEAD /fetch/{storeId}/{rootHash}/{path}` — probe a committed file.
pub async fn probe_file(
    State(state): State<AppState>,
    Path((store_id, tail)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let store_id = parse_store_id(&store_id)?;
    let (root, file_path) = tail
        .split_once('/')
        .ok_or_else(|| ApiError::BadRequest("expected <rootHash>/<path>".into()))?;
    let _root: RootHash = root
        .parse()
        .map_err(|_| ApiError::BadRequest("root hash must be 64 hex characters".into()))?;
    let rel = sanitize_rel_path(file_path)?;

    let size = state.store.file_size(&store_id, &rel).await;
    let mut headers = HeaderMap::new();
    headers.insert(X_FILE_EXISTS, bool_header(size.is_some()));
    if let Some(size) = size {
        headers.insert(
            X_FILE_SIZE,
            HeaderValue::from_str(&size.to_string()).expect("size is ascii"),
        );
    }
    Ok((StatusCode::OK, headers, ()))
}

/// `GET /fetch/{storeId}/{path}` — stream a committed file as stored.
///
/// Blobs under `data/` are served in their compressed form; callers
/// decompress. A read error after the headers have been flushed tears the
/// connection down.
pub async fn fetch_file(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path((store_id, file_path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let limit_key = format!(
        "{}|{}|{}",
        client_key(connect_info.as_ref()),
        store_id,
        file_path
    );
    if !state.fetch_limiter.check(&limit_key) {
        return Err(ApiError::RateLimited);
    }

    let store_id = parse_store_id(&store_id)?;
    let rel = sanitize_rel_path(&file_path)?;
    let (file, size) = state.store.open_file(&store_id, &rel).await?;

    let basename = rel
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let disposition = format!("attachment; filename=\"{basename}\"");

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, size)
        .header(CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(response)
}

async fn regenerate_manifest(state: &AppState, store_id: &StoreId) {
    match state.meta.root_history(store_id, false).await {
        Ok(history) => {
            if let Err(err) = state.store.regenerate_manifest(store_id, &history).await {
                warn!(store = %store_id, %err, "could not regenerate manifest");
            }
        }
        Err(err) => {
            warn!(store = %store_id, %err, "could not fetch root history for manifest");
        }
    }
}

fn parse_store_id(raw: &str) -> Result<StoreId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("store id must be 64 hex characters".into()))
}

fn parse_session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::BadRequest("session id must be a UUID".into()))
}

fn lookup_session(
    state: &AppState,
    store_id: &StoreId,
    session_id: &Uuid,
) -> Result<Arc<Session>, ApiError> {
    state
        .sessions
        .get(session_id)
        .filter(|session| session.store_id() == store_id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown session {session_id}")))
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {name} header")))
}

fn client_key(connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "local".to_string())
}

fn bool_header(value: bool) -> HeaderValue {
    HeaderValue::from_static(if value { "true" } else { "false" })
}
