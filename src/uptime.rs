//! Uptime ticker (C8): every second, derive `uptime` from `upSince`.
//!
//! Grounded in `utils/uptime_utils.py::increment_uptime` (plain `time.sleep(1)` loop) using
//! the teacher's `storage.rs::start_encryptor` interval-loop idiom in place of a bare sleep.

use crate::settings::SettingsStore;
use crate::util;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::debug;

pub async fn run(settings: Arc<SettingsStore>) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;

        let up_since = settings.get("upSince", serde_json::Value::Null).as_u64();
        let Some(up_since) = up_since else { continue };

        let now_ms = util::now_ms();
        let uptime_secs = now_ms.saturating_sub(up_since) / 1000;
        if let Err(err) = settings.set("uptime", json!(uptime_secs)) {
            debug!(error = %err, "failed updating uptime");
            continue;
        }
        debug!(uptime = uptime_secs, "uptime updated");
    }
}
