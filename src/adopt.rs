//! Adoption HTTPS server (C5): lets the controller claim this camera.
//!
//! Route/state shape follows the teacher's `api.rs` (`Arc<State>` + axum `Router`, TLS
//! serving via `axum-server`/`RustlsConfig` per the `other_examples` flyingrobots-echo
//! gateway). Request semantics are ported from `api_server.py`'s `do_POST`/`do_PUT`, with
//! the richer response shape and `canAdopt`-latching behavior the canonical spec calls for
//! in place of the original draft's bare `{"result":"success"}`.

use crate::settings::SettingsStore;
use crate::tls;
use crate::util::TokenEvent;
use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
struct AdoptState {
    settings: Arc<SettingsStore>,
    token_event: TokenEvent,
}

pub async fn run(
    settings: Arc<SettingsStore>,
    token_event: TokenEvent,
    cert_path: &Path,
    key_path: &Path,
) -> Result<()> {
    tls::ensure_self_signed_cert(cert_path, key_path).await?;
    let tls_config = tls::load(cert_path, key_path).await?;

    let state = AdoptState { settings, token_event };
    let app = Router::new()
        .route("/api/1.2/manage", post(manage).put(manage))
        .route("/", get(status))
        .fallback(fallback)
        .with_state(state);

    let addr: SocketAddr = "0.0.0.0:443".parse().expect("static address");
    info!(%addr, "adoption server listening");
    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn manage(State(state): State<AdoptState>, body: axum::body::Bytes) -> Response {
    let parsed: Result<Value, _> = serde_json::from_slice(&body);
    let data = match parsed {
        Ok(v) => v,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid JSON body"}))).into_response();
        }
    };

    let mgmt = data.get("mgmt").cloned().unwrap_or(json!({}));
    let token = mgmt.get("token").and_then(|v| v.as_str()).map(|s| s.to_string());
    let hosts = mgmt.get("hosts").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let first_host = hosts.first().and_then(|v| v.as_str()).map(|s| s.to_string());

    let (token, first_host) = match (token, first_host) {
        (Some(t), Some(h)) => (t, h),
        _ => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "Missing token or hosts"}))).into_response();
        }
    };

    let (host, port) = crate::util::parse_hostport(&first_host);
    let connection_host = format!("{host}:{port}");

    let response_host = apply_adoption(&state.settings, &mgmt, &token, &connection_host);
    state.token_event.notify();

    let mac = state.settings.get("mac", json!(""));
    let model = state.settings.get("marketName", json!(""));
    let firmware = state.settings.get("firmwareVersion", json!(""));
    let sysid = state.settings.get("sysid", json!(""));

    Json(json!({
        "mac": mac,
        "model": model,
        "firmwareVersion": firmware,
        "sysid": sysid,
        "token": token,
        "hosts": [response_host],
        "services": {"https": 443, "wss": 7442},
    }))
    .into_response()
}

/// Applies an adoption POST's effect on the settings store, independent of HTTP/TLS plumbing.
/// First adoption persists the whole `mgmt` block and latches `canAdopt` false; every later
/// adoption only rotates the token and keeps the original `connectionHost`. Returns the
/// `connectionHost` to report back to the caller.
fn apply_adoption(settings: &SettingsStore, mgmt: &Value, token: &str, connection_host: &str) -> String {
    let initialized = settings
        .get("mgmt.initialized", json!(false))
        .as_bool()
        .unwrap_or(false);

    if !initialized {
        if let Err(err) = settings.set("mgmt", mgmt.clone()) {
            warn!(error = %err, "failed persisting initial mgmt block");
        }
        let _ = settings.set("mgmt.connectionHost", json!(connection_host));
        let _ = settings.set("mgmt.initialized", json!(true));
        let _ = settings.set("canAdopt", json!(false));
    } else {
        let stored_host = settings.get("mgmt.connectionHost", json!(""));
        if stored_host.as_str() != Some(connection_host) {
            warn!(
                incoming = %connection_host,
                stored = %stored_host,
                "adoption host changed after initial adoption; keeping stored value"
            );
        }
        let _ = settings.set("mgmt.token", json!(token));
        let _ = settings.set("mgmt.tokenUpdatedAt", json!(crate::util::now_ms()));
    }

    settings
        .get("mgmt.connectionHost", json!(connection_host))
        .as_str()
        .unwrap_or(connection_host)
        .to_string()
}

async fn status(State(state): State<AdoptState>) -> Json<Value> {
    Json(json!({
        "mac": state.settings.get("mac", json!("")),
        "model": state.settings.get("marketName", json!("")),
        "canAdopt": state.settings.get("canAdopt", json!(true)),
        "uptime": state.settings.get("uptime", json!(0)),
    }))
}

async fn fallback(method: axum::http::Method) -> StatusCode {
    if method == axum::http::Method::DELETE {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> SettingsStore {
        let dir = tempdir().unwrap();
        SettingsStore::open(dir.path().join("settings.json")).unwrap()
    }

    #[test]
    fn first_adoption_persists_mgmt_and_latches_can_adopt_false() {
        let settings = store();
        let mgmt = json!({"token": "tok-1", "hosts": ["10.0.0.9:7442"], "initialized": true});

        let response_host = apply_adoption(&settings, &mgmt, "tok-1", "10.0.0.9:7442");

        assert_eq!(response_host, "10.0.0.9:7442");
        assert_eq!(settings.get("mgmt.initialized", json!(false)), json!(true));
        assert_eq!(settings.get("canAdopt", json!(true)), json!(false));
        assert_eq!(settings.get("mgmt.connectionHost", json!("")), json!("10.0.0.9:7442"));
        assert_eq!(settings.get("mgmt.token", json!("")), json!("tok-1"));
    }

    #[test]
    fn subsequent_adoption_rotates_token_and_keeps_connection_host() {
        let settings = store();
        let first_mgmt = json!({"token": "tok-1", "hosts": ["10.0.0.9:7442"], "initialized": true});
        apply_adoption(&settings, &first_mgmt, "tok-1", "10.0.0.9:7442");

        let second_mgmt = json!({"token": "tok-2", "hosts": ["10.0.0.50:7442"], "initialized": true});
        let response_host = apply_adoption(&settings, &second_mgmt, "tok-2", "10.0.0.50:7442");

        // the original connectionHost wins even though this POST reported a different one
        assert_eq!(response_host, "10.0.0.9:7442");
        assert_eq!(settings.get("mgmt.connectionHost", json!("")), json!("10.0.0.9:7442"));
        assert_eq!(settings.get("mgmt.token", json!("")), json!("tok-2"));
        assert!(settings.contains("mgmt.tokenUpdatedAt"));
        // canAdopt stays latched false from the first adoption
        assert_eq!(settings.get("canAdopt", json!(true)), json!(false));
    }
}
