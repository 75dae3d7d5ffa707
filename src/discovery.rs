//! UDP discovery responder (C4): answers UniFi Protect's adoption probe on port 10001.
//!
//! Wire format ported field-for-field from `discovery_responder.py::build_response`,
//! with the WEBUI tuple corrected to `(1,443)` per the canonical spec (the original draft
//! emitted `(0,80)`). Control-loop shape (1s poll timeout, exit when `canAdopt` flips false)
//! is also carried from the original's `start()`.

use crate::settings::SettingsStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DISCOVERY_PORT: u16 = 10001;
const VERSION: u8 = 1;
const CMD_INFO: u8 = 0;

fn field(id: u8, data: &[u8], out: &mut Vec<u8>) {
    out.push(id);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn parse_hex16(s: &str) -> Option<u16> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(s, 16).ok()
}

fn hex16_to_bytes(s: &str) -> Option<[u8; 16]> {
    let cleaned: String = s.chars().filter(|c| *c != '-').collect();
    if cleaned.len() != 32 {
        return None;
    }
    let bytes = hex::decode(cleaned).ok()?;
    bytes.try_into().ok()
}

fn build_response(settings: &SettingsStore) -> Result<Vec<u8>> {
    let mac = settings.mac_bytes("mac")?;
    let host = settings.get("host", serde_json::json!("")).as_str().unwrap_or("").to_string();
    let platform = settings.get("platform", serde_json::json!("")).as_str().unwrap_or("").to_string();
    let firmware = settings.get("firmwareVersion", serde_json::json!("")).as_str().unwrap_or("").to_string();
    let mac_str = settings.get("mac", serde_json::json!("")).as_str().unwrap_or("").to_string();
    let uptime = settings.get("uptime", serde_json::json!(0)).as_u64().unwrap_or(0) as u32;
    let sysid_str = settings.get("sysid", serde_json::json!("")).as_str().unwrap_or("").to_string();
    let market_name = settings.get("marketName", serde_json::json!("")).as_str().unwrap_or("").to_string();

    let mut payload = Vec::new();
    field(1, &mac, &mut payload);
    field(3, firmware.as_bytes(), &mut payload);
    field(10, &uptime.to_be_bytes(), &mut payload);
    field(11, host.as_bytes(), &mut payload);
    field(12, platform.as_bytes(), &mut payload);
    field(13, b"", &mut payload);
    field(14, &[1u8], &mut payload);

    let mut webui = Vec::with_capacity(4);
    webui.extend_from_slice(&1u16.to_be_bytes());
    webui.extend_from_slice(&443u16.to_be_bytes());
    field(15, &webui, &mut payload);

    if let Some(sysid) = parse_hex16(&sysid_str) {
        field(16, &sysid.to_le_bytes(), &mut payload);
    }

    if !market_name.is_empty() {
        field(20, market_name.as_bytes(), &mut payload);

        let short = market_name
            .strip_prefix("UVC_")
            .unwrap_or(&market_name)
            .replace('_', " ");
        field(21, short.as_bytes(), &mut payload);
    }

    field(32, mac_str.as_bytes(), &mut payload);

    if let Some(controller_id) = settings.get("controllerId", serde_json::Value::Null).as_str() {
        if let Some(bytes) = hex16_to_bytes(controller_id) {
            field(38, &bytes, &mut payload);
        }
    }
    if let Some(guid) = settings.get("guid", serde_json::Value::Null).as_str() {
        if let Some(bytes) = hex16_to_bytes(guid) {
            field(43, &bytes, &mut payload);
        }
    }

    field(44, &[1u8], &mut payload);

    let ip = settings.ip_bytes("host")?;
    let mut primary = Vec::with_capacity(10);
    primary.extend_from_slice(&mac);
    primary.extend_from_slice(&ip);
    field(47, &primary, &mut payload);

    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(VERSION);
    out.push(CMD_INFO);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Runs until `canAdopt` becomes false, then returns. Never propagates transient errors.
pub async fn run(settings: Arc<SettingsStore>) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
    info!(port = DISCOVERY_PORT, "discovery responder listening");

    let mut buf = [0u8; 1024];
    loop {
        if !settings.get("canAdopt", serde_json::json!(true)).as_bool().unwrap_or(true) {
            info!("exiting discovery loop, canAdopt is false");
            return Ok(());
        }

        let recv = timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await;
        let (len, addr) = match recv {
            Ok(Ok(v)) => v,
            Ok(Err(err)) => {
                warn!(error = %err, "discovery recv error");
                continue;
            }
            Err(_) => continue,
        };

        if len < 4 || &buf[..4] != [0x01, 0x00, 0x00, 0x00] {
            continue;
        }

        debug!(from = %addr, "received discovery probe");
        match build_response(&settings) {
            Ok(response) => {
                if let Err(err) = socket.send_to(&response, addr).await {
                    warn!(error = %err, "failed sending discovery response");
                }
            }
            Err(err) => warn!(error = %err, "failed building discovery response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_store() -> SettingsStore {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        store.update(
            json!({
                "mac": "aa:bb:cc:dd:ee:ff",
                "host": "192.168.1.50",
                "platform": "s5l",
                "firmwareVersion": "v4.70.24",
                "uptime": 120,
                "sysid": "0xa573",
                "type": "UVC G4 DOME",
                "marketName": "UVC_G4_DOME"
            })
            .as_object()
            .unwrap(),
        )
        .unwrap();
        store
    }

    #[test]
    fn response_has_expected_header_and_hwaddr_field() {
        let store = test_store();
        let response = build_response(&store).unwrap();
        assert_eq!(response[0], VERSION);
        assert_eq!(response[1], CMD_INFO);
        assert_eq!(response[4], 1); // first field id = HWADDR
        assert_eq!(&response[5..7], &6u16.to_be_bytes()); // HWADDR length = 6
        assert_eq!(&response[7..13], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn sysid_encoded_little_endian() {
        let store = test_store();
        let response = build_response(&store).unwrap();
        // find field id 16 and check byte order
        let mut i = 4;
        let mut found = None;
        while i + 3 <= response.len() {
            let id = response[i];
            let len = u16::from_be_bytes([response[i + 1], response[i + 2]]) as usize;
            let start = i + 3;
            if id == 16 {
                found = Some(response[start..start + len].to_vec());
                break;
            }
            i = start + len;
        }
        assert_eq!(found.unwrap(), vec![0x73, 0xa5]);
    }

    #[test]
    fn model_short_strips_prefix_and_underscores() {
        let store = test_store();
        let response = build_response(&store).unwrap();
        let mut i = 4;
        let mut found = None;
        while i + 3 <= response.len() {
            let id = response[i];
            let len = u16::from_be_bytes([response[i + 1], response[i + 2]]) as usize;
            let start = i + 3;
            if id == 21 {
                found = Some(String::from_utf8(response[start..start + len].to_vec()).unwrap());
                break;
            }
            i = start + len;
        }
        assert_eq!(found.unwrap(), "G4 DOME");
    }
}
