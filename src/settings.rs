//! Dot-path addressable settings store (C1): the system's persisted source of truth.
//!
//! Mirrors `CameraSettings` from the reference implementation: a JSON tree with `.`
//! as the nesting separator, one mutex covering both the in-memory tree and the file
//! on disk, and idempotent writes that skip the disk entirely when nothing changed.
//! Unlike the reference, persistence uses write-temp-then-rename so a crash mid-write
//! can never leave a half-written settings file behind.

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models;
use crate::util;

#[derive(Debug)]
pub enum SettingsError {
    NotFound(String),
    InvalidPath(String),
    MalformedField(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::NotFound(k) => write!(f, "setting not found: {k}"),
            SettingsError::InvalidPath(k) => {
                write!(f, "cannot descend into non-object value at: {k}")
            }
            SettingsError::MalformedField(msg) => write!(f, "malformed field: {msg}"),
        }
    }
}

impl std::error::Error for SettingsError {}

struct Inner {
    path: PathBuf,
    value: Value,
}

pub struct SettingsStore {
    inner: Mutex<Inner>,
}

impl SettingsStore {
    /// Loads `path` if present, otherwise seeds defaults and writes them.
    pub fn open(path: PathBuf) -> Result<Self> {
        let value = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading settings: {}", path.display()))?;
            serde_json::from_str(&raw).context("failed parsing settings.json")?
        } else {
            info!(path = %path.display(), "creating default settings");
            default_settings()
        };

        let store = Self {
            inner: Mutex::new(Inner { path, value }),
        };
        if !store.inner.lock().unwrap().path.exists() {
            store.persist_locked(&store.inner.lock().unwrap())?;
        }
        Ok(store)
    }

    pub fn get(&self, key: &str, default: Value) -> Value {
        let guard = self.inner.lock().unwrap();
        get_nested(&guard.value, key).cloned().unwrap_or(default)
    }

    pub fn get_required(&self, key: &str) -> Result<Value, SettingsError> {
        let guard = self.inner.lock().unwrap();
        get_nested(&guard.value, key)
            .cloned()
            .ok_or_else(|| SettingsError::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        let guard = self.inner.lock().unwrap();
        get_nested(&guard.value, key).is_some()
    }

    /// A full clone of the settings tree, for callers (the driver factory) that need to
    /// inspect more than one key at a time.
    pub fn snapshot(&self) -> Value {
        self.inner.lock().unwrap().value.clone()
    }

    /// Idempotent: a write that would not change the stored value never touches disk.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let changed = set_nested(&mut guard.value, key, value)
            .map_err(|e| anyhow!(e.to_string()))?;
        if changed {
            self.persist_locked(&guard)?;
        }
        Ok(())
    }

    /// Bulk update of flat (possibly dotted) keys; one disk write covers every change.
    pub fn update(&self, updates: &Map<String, Value>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let mut changed = false;
        for (k, v) in updates {
            changed |= set_nested(&mut guard.value, k, v.clone())
                .map_err(|e| anyhow!(e.to_string()))?;
        }
        if changed {
            self.persist_locked(&guard)?;
        }
        Ok(())
    }

    pub fn mac_bytes(&self, key: &str) -> Result<[u8; 6]> {
        let raw = self.get_required(key)?;
        let s = raw
            .as_str()
            .ok_or_else(|| anyhow!(SettingsError::MalformedField(format!("{key} is not a string"))))?;
        parse_mac(s).ok_or_else(|| anyhow!(SettingsError::MalformedField(format!("bad mac: {s}"))))
    }

    pub fn ip_bytes(&self, key: &str) -> Result<[u8; 4]> {
        let raw = self.get_required(key)?;
        let s = raw
            .as_str()
            .ok_or_else(|| anyhow!(SettingsError::MalformedField(format!("{key} is not a string"))))?;
        let addr: Ipv4Addr = s
            .parse()
            .map_err(|_| anyhow!(SettingsError::MalformedField(format!("bad ip: {s}"))))?;
        Ok(addr.octets())
    }

    fn persist_locked(&self, guard: &Inner) -> Result<()> {
        if let Some(parent) = guard.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed creating settings dir: {}", parent.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(&guard.value).context("failed serializing settings")?;
        let tmp_path = guard.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed writing settings tmp file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &guard.path)
            .with_context(|| format!("failed replacing settings file: {}", guard.path.display()))?;
        Ok(())
    }

    /// Runs the startup identity sequence: ensure host, mac, marketName/platform/sysid/type,
    /// then a best-effort firmware version refresh. Missing identity is fatal.
    pub async fn ensure_identity(&self, camera_model_env: Option<String>, iface: &str) -> Result<()> {
        self.ensure_host().await?;
        self.ensure_mac(iface)?;
        self.ensure_model(camera_model_env)?;
        self.ensure_upsince();
        self.refresh_firmware_version().await;
        Ok(())
    }

    async fn ensure_host(&self) -> Result<()> {
        if self.contains("host") {
            return Ok(());
        }
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed binding probe socket for local address discovery")?;
        socket
            .connect("8.8.8.8:80")
            .await
            .context("failed to determine local IP address")?;
        let local = socket
            .local_addr()
            .context("failed reading local address")?
            .ip()
            .to_string();
        self.set("host", json!(local))?;
        Ok(())
    }

    fn ensure_mac(&self, iface: &str) -> Result<()> {
        if self.contains("mac") {
            return Ok(());
        }
        let path = format!("/sys/class/net/{iface}/address");
        let mac = std::fs::read_to_string(&path)
            .with_context(|| format!("network interface '{iface}' not found"))?;
        let mac = mac.trim().to_string();
        if mac.is_empty() {
            return Err(anyhow!("empty MAC address for interface '{iface}'"));
        }
        self.set("mac", json!(mac))?;
        Ok(())
    }

    fn ensure_model(&self, camera_model_env: Option<String>) -> Result<()> {
        if !self.contains("marketName") || self.get("marketName", json!("")).as_str() == Some("") {
            let model = camera_model_env
                .or_else(|| std::env::var("CAMERA_MODEL").ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("CAMERA_MODEL environment variable is required to set type or platform"))?;
            self.set("marketName", json!(model))?;
        }

        let market_name = self
            .get_required("marketName")?
            .as_str()
            .ok_or_else(|| anyhow!("marketName is not a string"))?
            .to_string();

        if !self.contains("platform") || self.get("platform", json!("")).as_str() == Some("") {
            let platform = models::platform(&market_name)
                .ok_or_else(|| anyhow!("unknown platform for type: {market_name}"))?;
            self.set("platform", json!(platform))?;
        }

        if !self.contains("sysid") || self.get("sysid", json!("")).as_str() == Some("") {
            let sysid = models::sysid(&market_name)
                .ok_or_else(|| anyhow!("unknown system ID for type: {market_name}"))?;
            self.set("sysid", json!(format!("0x{sysid:04x}")))?;
        }

        if !self.contains("type") || self.get("type", json!("")).as_str() == Some("") {
            self.set("type", json!(market_name.replace('_', " ")))?;
        }

        if models::is_eol(&market_name) {
            warn!(market_name = %market_name, "emulating an end-of-life camera model");
        }

        Ok(())
    }

    fn ensure_upsince(&self) {
        if !self.contains("upSince") {
            let _ = self.set("upSince", json!(util::now_ms()));
        }
        if !self.contains("uptime") {
            let _ = self.set("uptime", json!(0));
        }
        if !self.contains("canAdopt") {
            let _ = self.set("canAdopt", json!(true));
        }
    }

    /// Best-effort; never fatal. See SPEC_FULL.md §4.1.1.
    async fn refresh_firmware_version(&self) {
        let status = std::env::var("FIRMWARE_STATUS").unwrap_or_else(|_| "GA".to_string());
        match fetch_latest_firmware(&status).await {
            Ok(Some(version)) => {
                let current = self.get("firmwareVersion", json!(""));
                if current.as_str() != Some(version.as_str()) {
                    if let Err(err) = self.set("firmwareVersion", json!(version.clone())) {
                        warn!(error = %err, "failed persisting fetched firmware version");
                    } else {
                        info!(version = %version, "latest camera firmware");
                    }
                }
            }
            Ok(None) => debug!("latest camera firmware: unavailable via API"),
            Err(err) => debug!(error = %err, "firmware lookup failed (non-fatal)"),
        }
    }
}

/// Parses a GraphQL firmware feed the way the reference client does: try progressively
/// looser variable sets until one returns items, then prefer the Cameras family and the
/// requested release stage, tie-broken by semver.
async fn fetch_latest_firmware(status: &str) -> Result<Option<String>> {
    const API_URL: &str = "https://community.svc.ui.com/graphql";
    const QUERY: &str = "query ReleaseFeedListQuery($tags:[String!],$betas:[String!],$alphas:[String!],$offset:Int,$limit:Int,$sortBy:ReleasesSortBy,$searchTerm:String,$filterTags:[String!]){releases(tags:$tags,betas:$betas,alphas:$alphas,offset:$offset,limit:$limit,sortBy:$sortBy,searchTerm:$searchTerm,filterTags:$filterTags){items{title slug tags stage version createdAt lastActivityAt}}}";

    let preferred_stage = status.to_uppercase();
    let var_candidates = [
        json!({"limit":10,"offset":0,"sortBy":"LATEST","tags":["unifi-protect"],"betas":[],"alphas":[],"searchTerm":"camera","filterTags":["cameras"]}),
        json!({"limit":10,"offset":0,"sortBy":"LATEST","tags":["unifi-protect"],"betas":[],"alphas":[],"searchTerm":"camera"}),
        json!({"limit":10,"offset":0,"sortBy":"LATEST","tags":["unifi-protect"],"betas":[],"alphas":[]}),
        json!({"limit":10,"offset":0,"sortBy":"LATEST","betas":[],"alphas":[],"searchTerm":"UniFi Protect Cameras"}),
        json!({"limit":10,"offset":0,"sortBy":"LATEST"}),
    ];

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .context("failed building firmware lookup client")?;

    let mut items: Vec<Value> = Vec::new();
    for vars in var_candidates {
        let body = json!({
            "query": QUERY,
            "variables": vars,
            "operationName": "ReleaseFeedListQuery",
        });
        let resp = match client.post(API_URL).json(&body).send().await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let parsed: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => continue,
        };
        let found = parsed
            .pointer("/data/releases/items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if !found.is_empty() {
            items = found;
            break;
        }
    }

    if items.is_empty() {
        return Ok(None);
    }

    let is_cameras = |item: &Value| {
        let title = item.get("title").and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
        let slug = item.get("slug").and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
        title.contains("unifi protect cameras") || slug.contains("unifi-protect-cameras") || title.contains("cameras")
    };

    let cam_items: Vec<&Value> = items.iter().filter(|i| is_cameras(i)).collect();
    let cam_items: Vec<&Value> = if cam_items.is_empty() { items.iter().collect() } else { cam_items };

    let stage_items: Vec<&Value> = cam_items
        .iter()
        .copied()
        .filter(|i| {
            i.get("stage").and_then(|v| v.as_str()).unwrap_or("").to_uppercase() == preferred_stage
        })
        .collect();
    let candidates = if stage_items.is_empty() { cam_items } else { stage_items };

    let picked = candidates.into_iter().max_by_key(|item| {
        let version = item.get("version").and_then(|v| v.as_str()).unwrap_or("0.0.0");
        let semver = parse_semver(version);
        let activity = item.get("lastActivityAt").and_then(|v| v.as_str()).unwrap_or("").to_string();
        (semver, activity)
    });

    Ok(picked.and_then(|item| item.get("version").and_then(|v| v.as_str()).map(|s| s.to_string())))
}

fn parse_semver(v: &str) -> (u64, u64, u64) {
    let mut parts = v.split('.').filter_map(|p| p.parse::<u64>().ok());
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

fn default_settings() -> Value {
    json!({
        "mac": "",
        "host": "",
        "type": "",
        "sysid": "",
        "platform": "",
        "marketName": "",
        "firmwareVersion": "",
        "canAdopt": true,
        "upSince": util::now_ms(),
        "uptime": 0,
        "logging": {
            "level": "info",
            "api": { "level": "debug" },
            "discovery": { "level": "info" },
            "uptime": { "level": "info" },
            "wss": { "level": "debug" }
        }
    })
}

fn get_nested<'a>(root: &'a Value, dotted_key: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in dotted_key.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_nested(root: &mut Value, dotted_key: &str, value: Value) -> Result<bool, SettingsError> {
    let parts: Vec<&str> = dotted_key.split('.').collect();
    if !root.is_object() {
        *root = json!({});
    }
    let mut current = root;
    for part in &parts[..parts.len() - 1] {
        let obj = current
            .as_object_mut()
            .ok_or_else(|| SettingsError::InvalidPath(dotted_key.to_string()))?;
        current = obj
            .entry(part.to_string())
            .or_insert_with(|| json!({}));
        if !current.is_object() {
            return Err(SettingsError::InvalidPath(dotted_key.to_string()));
        }
    }

    let last = parts[parts.len() - 1];
    let obj = current
        .as_object_mut()
        .ok_or_else(|| SettingsError::InvalidPath(dotted_key.to_string()))?;

    if let Some(existing) = obj.get(last) {
        if *existing == value {
            return Ok(false);
        }
    }
    obj.insert(last.to_string(), value);
    Ok(true)
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let cleaned: String = s.chars().filter(|c| *c != ':').collect();
    if cleaned.len() != 12 {
        return None;
    }
    let bytes = hex::decode(cleaned).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_at(path: &Path) -> SettingsStore {
        SettingsStore::open(path.to_path_buf()).unwrap()
    }

    #[test]
    fn round_trips_nested_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = store_at(&path);
        store.set("mgmt.connectionHost", json!("10.0.0.1:7442")).unwrap();
        assert_eq!(
            store.get("mgmt.connectionHost", json!(null)),
            json!("10.0.0.1:7442")
        );

        let reloaded = SettingsStore::open(path).unwrap();
        assert_eq!(
            reloaded.get("mgmt.connectionHost", json!(null)),
            json!("10.0.0.1:7442")
        );
    }

    #[test]
    fn idempotent_set_is_a_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = store_at(&path);
        store.set("canAdopt", json!(false)).unwrap();
        let mtime_before = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        store.set("canAdopt", json!(false)).unwrap();
        let mtime_after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn invalid_path_through_scalar_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = store_at(&path);
        store.set("mac", json!("aabbccddeeff")).unwrap();
        let err = store.set("mac.nested", json!(1)).unwrap_err();
        assert!(err.to_string().contains("non-object"));
    }

    #[test]
    fn mac_bytes_parses_colon_form() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = store_at(&path);
        store.set("mac", json!("aa:bb:cc:dd:ee:ff")).unwrap();
        assert_eq!(store.mac_bytes("mac").unwrap(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn ip_bytes_parses_dotted_form() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = store_at(&path);
        store.set("host", json!("192.168.1.10")).unwrap();
        assert_eq!(store.ip_bytes("host").unwrap(), [192, 168, 1, 10]);
    }

    #[test]
    fn missing_required_key_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = store_at(&path);
        assert!(store.get_required("mgmt.token").is_err());
    }
}
