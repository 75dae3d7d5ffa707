//! WSS manager (C7): the single outbound connection to the controller, reconnecting on
//! failure and dispatching inbound commands to the camera driver (C3).
//!
//! Canonical behavior ported from `wss_manager.py`: connect-key tracking, hello envelope,
//! per-function handler table, log filtering/throttling, and snapshot-debug capture. TLS
//! and websocket plumbing follow the `other_examples` Cynary-unifi-monitoring pattern
//! (`native_tls::TlsConnector` with `danger_accept_invalid_certs`, wrapped as a
//! `tokio_tungstenite::Connector::NativeTls`). Reconnect-loop and stop-event shape follow
//! the teacher's `swarm.rs` idiom.

use crate::driver::CameraDriver;
use crate::settings::SettingsStore;
use crate::util::{self, TokenEvent};
use anyhow::{Context, Result, anyhow};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const DEFAULT_NOISY: &[&str] = &[
    "NetworkStatus",
    "GetSystemStats",
    "ubnt_avclient_paramAgreement",
    "ChangeOsdSettings",
    "ChangeSoundLedSettings",
    "ChangeTalkbackSettings",
    "ChangeAnalyticsSettings",
    "ChangeDeviceSettings",
    "ChangeVideoSettings",
    "ChangeIspSettings",
    "UpdateUsernamePassword",
];

struct LogFilter {
    only: HashSet<String>,
    silence: HashSet<String>,
    throttle_secs: f64,
    last_logged: StdMutex<HashMap<String, Instant>>,
}

impl LogFilter {
    fn from_env() -> Self {
        let split_env = |var: &str| -> HashSet<String> {
            std::env::var(var)
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            only: split_env("WSS_LOG_ONLY"),
            silence: split_env("WSS_SILENCE"),
            throttle_secs: std::env::var("WSS_THROTTLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            last_logged: StdMutex::new(HashMap::new()),
        }
    }

    fn should_log(&self, fn_name: &str) -> bool {
        if fn_name.is_empty() {
            return true;
        }
        if !self.only.is_empty() {
            return self.only.contains(fn_name);
        }
        if self.silence.contains(fn_name) || DEFAULT_NOISY.contains(&fn_name) {
            return false;
        }
        true
    }

    fn throttle_ok(&self, fn_name: &str) -> bool {
        if self.throttle_secs <= 0.0 || !matches!(fn_name, "NetworkStatus" | "GetSystemStats") {
            return true;
        }
        let mut last = self.last_logged.lock().unwrap();
        let now = Instant::now();
        match last.get(fn_name) {
            Some(t) if now.duration_since(*t).as_secs_f64() < self.throttle_secs => false,
            _ => {
                last.insert(fn_name.to_string(), now);
                true
            }
        }
    }

    fn log_frame(&self, direction: &str, fn_name: &str, raw: &str) {
        if self.should_log(fn_name) && self.throttle_ok(fn_name) {
            debug!(direction, fn_name, raw, "wss frame");
        }
    }
}

struct Session {
    writer: Arc<Mutex<WsWriter>>,
    msg_id: AtomicU64,
    driver: Arc<dyn CameraDriver>,
    settings: Arc<SettingsStore>,
    filter: Arc<LogFilter>,
    snapshot_debug: bool,
}

impl Session {
    fn next_msg_id(&self) -> u64 {
        self.msg_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn device_id(&self) -> String {
        self.settings
            .get("mac", json!(""))
            .as_str()
            .unwrap_or("")
            .to_uppercase()
    }

    async fn send(&self, value: &Value) -> Result<()> {
        let fn_name = value.get("functionName").and_then(|v| v.as_str()).unwrap_or("");
        let raw = serde_json::to_string(value)?;
        self.filter.log_frame("tx", fn_name, &raw);
        self.writer.lock().await.send(Message::Text(raw.into())).await?;
        Ok(())
    }

    async fn reply(&self, in_msg: &Value, payload: Value) -> Result<()> {
        let fn_name = in_msg.get("functionName").cloned().unwrap_or(json!(""));
        let in_mid = in_msg.get("messageId").and_then(|v| v.as_u64()).unwrap_or(0);
        let out = json!({
            "from": "ubnt_avclient",
            "to": "UniFiVideo",
            "functionName": fn_name,
            "messageId": self.next_msg_id(),
            "inResponseTo": in_mid,
            "payload": payload,
        });
        self.send(&out).await
    }

    async fn reply_ok(&self, in_msg: &Value, extra: Value) -> Result<()> {
        let mut payload = json!({"statusCode": 0, "status": "ok", "deviceID": self.device_id()});
        if let (Some(obj), Some(extra_obj)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.reply(in_msg, payload).await
    }

    async fn send_hello(&self) -> Result<()> {
        let connection_host = self.settings.get("mgmt.connectionHost", json!(""));
        let hello = json!({
            "functionName": "ubnt_avclient_hello",
            "messageId": self.next_msg_id(),
            "payload": {
                "fwVersion": self.settings.get("firmwareVersion", json!("v5.0.129")),
                "ip": self.settings.get("host", json!("")),
                "uptime": self.settings.get("uptime", json!(0)),
                "connectionHost": connection_host,
                "connectionSecurePort": 7442,
                "protocolVersion": 1,
            },
        });
        self.send(&hello).await
    }
}

/// Runs the reconnecting WSS client until the process stops. Never returns an error that
/// should terminate the process; failures are logged and retried.
pub async fn run(settings: Arc<SettingsStore>, token_event: TokenEvent, driver: Arc<dyn CameraDriver>) {
    let filter = Arc::new(LogFilter::from_env());
    let snapshot_debug = std::env::var("SNAPSHOT_DEBUG")
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let mut current_key: Option<(String, u16, String)> = None;

    loop {
        let token = settings.get("mgmt.token", Value::Null).as_str().map(|s| s.to_string());
        let hostport = settings.get("mgmt.connectionHost", Value::Null).as_str().map(|s| s.to_string());

        let (Some(token), Some(hostport)) = (token, hostport) else {
            debug!("wss: waiting for token/host");
            token_event.wait_timeout(Duration::from_secs(10)).await;
            continue;
        };

        let (host, port) = util::parse_hostport(&hostport);
        let key = (host.clone(), port, token.clone());
        if Some(&key) != current_key.as_ref() {
            info!(host, port, "wss: (re)connecting, token/host changed");
            current_key = Some(key);
        }

        if let Err(err) = connect_and_serve(
            &host,
            port,
            &token,
            settings.clone(),
            driver.clone(),
            filter.clone(),
            snapshot_debug,
        )
        .await
        {
            warn!(error = %err, "wss: connection failed, retrying in 5s");
            token_event.wait_timeout(Duration::from_secs(5)).await;
        }
    }
}

async fn connect_and_serve(
    host: &str,
    port: u16,
    token: &str,
    settings: Arc<SettingsStore>,
    driver: Arc<dyn CameraDriver>,
    filter: Arc<LogFilter>,
    snapshot_debug: bool,
) -> Result<()> {
    let url = format!("wss://{host}:{port}/camera/1.0/ws?token={token}");
    let mac = settings.get("mac", json!("")).as_str().unwrap_or("").to_lowercase();
    let sysid = settings.get("sysid", json!("0xa573")).as_str().unwrap_or("0xa573").to_string();

    let tls_connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .context("failed building wss tls connector")?;
    let connector = Connector::NativeTls(tls_connector);

    let (ws_stream, subprotocol_ok) = match dial(&url, &mac, &sysid, true, &connector).await {
        Ok(stream) => (stream, true),
        Err(_) => {
            warn!("wss: handshake with secure_transfer subprotocol failed, retrying without");
            (dial(&url, &mac, &sysid, false, &connector).await?, false)
        }
    };
    debug!(subprotocol_ok, "wss connected");

    let (writer, reader) = ws_stream.split();
    let session = Arc::new(Session {
        writer: Arc::new(Mutex::new(writer)),
        msg_id: AtomicU64::new(0),
        driver,
        settings,
        filter,
        snapshot_debug,
    });

    session.send_hello().await?;

    let stats_task = if session
        .settings
        .get("wss.syncStatsAndVideo", json!(false))
        .as_bool()
        .unwrap_or(false)
    {
        Some(tokio::spawn(sync_stats_and_video_loop(session.clone())))
    } else {
        None
    };

    let result = serve_loop(&session, reader).await;
    if let Some(task) = stats_task {
        task.abort();
    }
    result
}

/// Periodic `cameras.syncStatsAndVideo` push, gated on the `wss.syncStatsAndVideo` setting
/// (default off). A send failure ends this task only; the main connection and dispatch
/// loop are unaffected.
async fn sync_stats_and_video_loop(session: Arc<Session>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let frame = json!({
            "functionName": "cameras.syncStatsAndVideo",
            "messageId": session.next_msg_id(),
            "payload": {
                "stats": session.driver.get_system_stats().await,
                "uptime": session.settings.get("uptime", json!(0)),
            },
        });
        if let Err(err) = session.send(&frame).await {
            warn!(error = %err, "wss: periodic syncStatsAndVideo failed, stopping periodic task");
            return;
        }
    }
}

async fn dial(
    url: &str,
    mac: &str,
    sysid: &str,
    with_subprotocol: bool,
    connector: &native_tls::TlsConnector,
) -> Result<WsStream> {
    let mut request = url.into_client_request().context("invalid wss url")?;
    request.headers_mut().insert(
        "Camera-Mac",
        HeaderValue::from_str(mac).context("invalid mac header")?,
    );
    request.headers_mut().insert(
        "Camera-Model",
        HeaderValue::from_str(sysid).context("invalid sysid header")?,
    );
    if with_subprotocol {
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("secure_transfer"),
        );
    }

    let connector = Connector::NativeTls(connector.clone());
    let (stream, _response) = connect_async_tls_with_config(request, None, false, Some(connector))
        .await
        .context("wss handshake failed")?;
    Ok(stream)
}

async fn serve_loop(session: &Session, mut reader: WsReader) -> Result<()> {
    while let Some(frame) = reader.next().await {
        let frame = frame.context("wss read error")?;
        let text = match frame {
            Message::Text(t) => t.to_string(),
            Message::Binary(b) => {
                session.filter.log_frame("rx", "", &format!("(binary {} bytes)", b.len()));
                continue;
            }
            Message::Close(_) => return Err(anyhow!("wss: server closed connection")),
            _ => continue,
        };

        let msg: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                session.filter.log_frame("rx", "", &text);
                continue;
            }
        };

        let fn_name = msg.get("functionName").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let expect = msg.get("responseExpected").and_then(|v| v.as_bool()).unwrap_or(false);
        session.filter.log_frame("rx", &fn_name, &text);

        if fn_name == "ubnt_avclient_hello" {
            continue;
        }

        if let Err(err) = dispatch(session, &fn_name, &msg, expect).await {
            warn!(error = %err, fn_name, "wss: handler failed");
        }
    }
    Ok(())
}

async fn dispatch(session: &Session, fn_name: &str, msg: &Value, expect: bool) -> Result<()> {
    let payload = msg.get("payload").cloned().unwrap_or(json!({}));

    match fn_name {
        "ubnt_avclient_paramAgreement" => {
            if expect {
                session.reply(msg, json!({"statusCode": 0, "status": "ok"})).await?;
            }
        }
        "ubnt_avclient_timeSync" => {
            let now = util::now_ms();
            session.reply(msg, json!({"t1": now, "t2": now})).await?;
        }
        "ubnt_avclient_configure" | "ubnt_avclient_start" => {
            if expect {
                session.reply_ok(msg, json!({})).await?;
            }
        }
        "GetSystemStats" => {
            if expect {
                let mut stats = session.driver.get_system_stats().await;
                if let Some(obj) = stats.as_object_mut() {
                    obj.insert("uptime".to_string(), session.settings.get("uptime", json!(0)));
                }
                session.reply(msg, stats).await?;
            }
        }
        "NetworkStatus" => {
            if expect {
                session
                    .reply(
                        msg,
                        json!({
                            "status": "connected",
                            "ip": session.settings.get("host", json!("")),
                            "mac": session.settings.get("mac", json!("")).as_str().unwrap_or("").to_lowercase(),
                        }),
                    )
                    .await?;
            }
        }
        "ChangeVideoSettings" => {
            if expect {
                let applied = session.driver.apply_video_settings(&payload).await;
                session.reply_ok(msg, applied).await?;
            }
        }
        "ChangeIspSettings" => {
            if expect {
                let applied = session.driver.apply_isp_settings(&payload).await;
                session.reply_ok(msg, applied).await?;
            }
        }
        "ChangeOsdSettings" | "ChangeSoundLedSettings" | "ChangeTalkbackSettings"
        | "ChangeAnalyticsSettings" | "ChangeDeviceSettings" | "AnalyticsTest"
        | "UpdateUsernamePassword" => {
            if expect {
                session.reply_ok(msg, payload).await?;
            }
        }
        "GetRequest" => {
            handle_get_request(session, msg, &payload, expect).await?;
        }
        _ => {
            if expect {
                session.reply_ok(msg, json!({})).await?;
            }
        }
    }
    Ok(())
}

async fn handle_get_request(session: &Session, msg: &Value, payload: &Value, expect: bool) -> Result<()> {
    if payload.get("what").and_then(|v| v.as_str()) != Some("snapshot") {
        if expect {
            session.reply_ok(msg, json!({})).await?;
        }
        return Ok(());
    }

    let uri = payload.get("uri").and_then(|v| v.as_str()).map(|s| s.to_string());
    let timeout_ms = payload.get("timeoutMs").and_then(|v| v.as_u64()).unwrap_or(60_000);
    let timeout_s = (timeout_ms / 1000).max(1);
    let driver_timeout = Duration::from_secs((timeout_s / 2).max(1));

    let Some(uri) = uri else {
        if expect {
            session.reply(msg, json!({"statusCode": 1, "status": "error", "deviceID": session.device_id()})).await?;
        }
        return Ok(());
    };

    let jpeg = match session.driver.get_snapshot_jpeg(driver_timeout).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "get_snapshot_jpeg failed");
            if expect {
                session
                    .reply(msg, json!({"statusCode": 1, "status": "error", "deviceID": session.device_id()}))
                    .await?;
            }
            return Ok(());
        }
    };

    if session.snapshot_debug {
        save_snapshot_debug(&jpeg).await;
    }

    upload_snapshot_and_ack(session, msg, &jpeg, &uri, Duration::from_secs(timeout_s)).await
}

async fn save_snapshot_debug(jpeg: &[u8]) {
    const DIR: &str = "debug_snaps";
    const KEEP: usize = 5;

    let sha = {
        let mut hasher = Sha256::new();
        hasher.update(jpeg);
        hex::encode(hasher.finalize())
    };
    info!(len = jpeg.len(), sha256 = %sha[..12.min(sha.len())], head = %hex::encode(&jpeg[..jpeg.len().min(8)]), "snapshot debug");

    let dir = std::path::Path::new(DIR);
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        warn!(error = %err, "snapshot debug: failed creating dir");
        return;
    }
    let path = dir.join(format!("snapshot_{}.jpg", util::now_unix_seconds()));
    if let Err(err) = tokio::fs::write(&path, jpeg).await {
        warn!(error = %err, "snapshot debug: failed writing file");
        return;
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(_) => return,
    };
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("snapshot_") && name.ends_with(".jpg") {
            if let Ok(meta) = entry.metadata().await {
                if let Ok(modified) = meta.modified() {
                    files.push((modified, entry.path()));
                }
            }
        }
    }
    files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, stale) in files.into_iter().skip(KEEP) {
        if let Err(err) = tokio::fs::remove_file(&stale).await {
            warn!(error = %err, path = %stale.display(), "snapshot debug: failed pruning");
        }
    }
}

async fn upload_snapshot_and_ack(
    session: &Session,
    in_msg: &Value,
    jpeg: &[u8],
    uri: &str,
    timeout: Duration,
) -> Result<()> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
        .context("failed building snapshot upload client")?;

    let result = client
        .put(uri)
        .header("Content-Type", "image/jpeg")
        .body(jpeg.to_vec())
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().as_u16() == 200 || resp.status().as_u16() == 204 => {
            session.reply(in_msg, json!({"statusCode": 0, "status": "ok", "deviceID": session.device_id()})).await
        }
        Ok(resp) => {
            warn!(status = %resp.status(), "snapshot upload unexpected status");
            session.reply(in_msg, json!({"statusCode": 1, "status": "error", "deviceID": session.device_id()})).await
        }
        Err(err) => {
            warn!(error = %err, "snapshot upload failed");
            session.reply(in_msg, json!({"statusCode": 1, "status": "error", "deviceID": session.device_id()})).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_noisy_functions_are_silenced_without_only() {
        let filter = LogFilter {
            only: HashSet::new(),
            silence: HashSet::new(),
            throttle_secs: 0.0,
            last_logged: StdMutex::new(HashMap::new()),
        };
        assert!(!filter.should_log("NetworkStatus"));
        assert!(filter.should_log("GetRequest"));
    }

    #[test]
    fn only_list_overrides_defaults() {
        let mut only = HashSet::new();
        only.insert("NetworkStatus".to_string());
        let filter = LogFilter {
            only,
            silence: HashSet::new(),
            throttle_secs: 0.0,
            last_logged: StdMutex::new(HashMap::new()),
        };
        assert!(filter.should_log("NetworkStatus"));
        assert!(!filter.should_log("GetRequest"));
    }

    #[test]
    fn throttle_blocks_rapid_repeats() {
        let filter = LogFilter {
            only: HashSet::new(),
            silence: HashSet::new(),
            throttle_secs: 60.0,
            last_logged: StdMutex::new(HashMap::new()),
        };
        assert!(filter.throttle_ok("NetworkStatus"));
        assert!(!filter.throttle_ok("NetworkStatus"));
    }
}
