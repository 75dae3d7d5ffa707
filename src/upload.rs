//! Snapshot upload HTTPS sink (C6): the endpoint the controller PUTs camera snapshots to
//! when it pulls a snapshot on demand via C7 (see `wss.rs`'s `GetRequest` handler).
//!
//! Ported from `upload_server.py`: same routes, same sha256 fingerprinting and diagnostic
//! headers, same optional save-to-disk behavior.

use anyhow::Result;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::tls;

#[derive(Clone, Default)]
struct LastSnapshot {
    bytes: Vec<u8>,
    when: String,
    length: usize,
    sha256: String,
    path: String,
    client: String,
}

#[derive(Clone)]
struct UploadState {
    last: Arc<Mutex<Option<LastSnapshot>>>,
    save_dir: Option<PathBuf>,
}

pub async fn run(cert_path: &Path, key_path: &Path, save_dir: Option<PathBuf>) -> Result<()> {
    tls::ensure_self_signed_cert(cert_path, key_path).await?;
    let tls_config = tls::load(cert_path, key_path).await?;

    let state = UploadState { last: Arc::new(Mutex::new(None)), save_dir };
    let app = Router::new()
        .route("/internal/camera-upload/{token}", put(upload))
        .route("/debug/last-snapshot", get(last_snapshot))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state);

    let addr: SocketAddr = "0.0.0.0:7444".parse().expect("static address");
    info!(%addr, "snapshot upload server listening");
    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

async fn upload(
    State(state): State<UploadState>,
    AxumPath(token): AxumPath<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Response {
    let sha = {
        let mut hasher = Sha256::new();
        hasher.update(&body);
        hex::encode(hasher.finalize())
    };

    let entry = LastSnapshot {
        bytes: body.to_vec(),
        when: crate::util::now_iso8601(),
        length: body.len(),
        sha256: sha.clone(),
        path: format!("/internal/camera-upload/{token}"),
        client: peer.ip().to_string(),
    };

    if let Some(dir) = &state.save_dir {
        if let Err(err) = save_to_disk(dir, &token, &body).await {
            warn!(error = %err, "failed saving snapshot to disk");
        }
    }

    debug!(len = entry.length, sha256 = %entry.sha256[..12.min(entry.sha256.len())], "snapshot upload received");
    *state.last.lock().await = Some(entry);
    StatusCode::OK.into_response()
}

async fn save_to_disk(dir: &Path, token: &str, body: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let tmp = dir.join(format!(".{ts}_{token}.jpg.tmp"));
    let final_path = dir.join(format!("{ts}_{token}.jpg"));
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, &final_path).await?;
    Ok(())
}

async fn last_snapshot(State(state): State<UploadState>) -> Response {
    let guard = state.last.lock().await;
    let Some(entry) = guard.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", HeaderValue::from_static("image/jpeg"));
    headers.insert("X-Bytes", HeaderValue::from_str(&entry.length.to_string()).unwrap());
    headers.insert("X-Meta-When", HeaderValue::from_str(&entry.when).unwrap_or(HeaderValue::from_static("")));
    headers.insert("X-Meta-Sha256", HeaderValue::from_str(&entry.sha256).unwrap_or(HeaderValue::from_static("")));
    headers.insert("X-Meta-Path", HeaderValue::from_str(&entry.path).unwrap_or(HeaderValue::from_static("")));
    headers.insert("X-Meta-Client", HeaderValue::from_str(&entry.client).unwrap_or(HeaderValue::from_static("")));

    (StatusCode::OK, headers, entry.bytes.clone()).into_response()
}
