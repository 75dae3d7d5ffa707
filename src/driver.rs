//! Brand-agnostic camera driver (C3).
//!
//! Mirrors the reference `CameraDriver` ABC: a small async trait with one required method
//! and sane defaults for the rest, plus two variants (`null`, `amcrest`) and a factory that
//! picks one from a settings value. Both variants follow the shape of
//! `drivers/{camera_driver,null,amcrest,camera_factory}.py`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use image::{ImageBuffer, Rgb, RgbImage};
use serde_json::{Value, json};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

use crate::digest_auth;
use crate::font5x7;

#[async_trait]
pub trait CameraDriver: Send + Sync {
    async fn get_snapshot_jpeg(&self, timeout: Duration) -> Result<Vec<u8>>;

    async fn get_system_stats(&self) -> Value {
        json!({"cpu": 5, "memory": 20, "temperature": 45})
    }

    async fn apply_video_settings(&self, payload: &Value) -> Value {
        json!({"video": payload.get("video").cloned().unwrap_or(json!({}))})
    }

    async fn apply_isp_settings(&self, payload: &Value) -> Value {
        let _ = payload;
        json!({})
    }

    async fn network_status(&self) -> Value {
        json!({"status": "connected"})
    }

    async fn close(&self) {}
}

/// Synthesizes a diagnostic JPEG: no real sensor behind it, just color bars, a grid,
/// and a label so operators can tell the emulator's feed apart from a real camera's.
pub struct NullDriver {
    name: String,
}

impl NullDriver {
    pub fn new(name: String) -> Self {
        Self { name }
    }

    fn synthesize(&self) -> Result<Vec<u8>> {
        const W: u32 = 1280;
        const H: u32 = 720;
        let mut img: RgbImage = ImageBuffer::from_pixel(W, H, Rgb([32, 32, 32]));

        let bars: [[u8; 3]; 7] = [
            [255, 255, 255],
            [255, 255, 0],
            [0, 255, 255],
            [0, 255, 0],
            [255, 0, 255],
            [255, 0, 0],
            [0, 0, 255],
        ];
        let bw = W / bars.len() as u32;
        for (i, color) in bars.iter().enumerate() {
            let x0 = i as u32 * bw;
            let x1 = if i == bars.len() - 1 { W } else { x0 + bw };
            for y in 0..H / 2 {
                for x in x0..x1 {
                    img.put_pixel(x, y, Rgb(*color));
                }
            }
        }

        for x in (0..W).step_by(80) {
            for y in H / 2..H {
                img.put_pixel(x, y, Rgb([60, 60, 60]));
            }
        }
        for y in (H / 2..H).step_by(80) {
            for x in 0..W {
                img.put_pixel(x, y, Rgb([60, 60, 60]));
            }
        }

        let ts = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let text = format!("{}  {ts}  {W}x{H}", self.name);
        draw_label(&mut img, 10, H / 2 + 10, &text);

        let mut buf = Cursor::new(Vec::new());
        {
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 80);
            encoder
                .encode_image(&img)
                .context("failed encoding synthesized snapshot as JPEG")?;
        }
        Ok(buf.into_inner())
    }
}

fn draw_label(img: &mut RgbImage, x: u32, y: u32, text: &str) {
    let scale = 2u32;
    let pad = 10u32;
    let glyph_w = (font5x7::GLYPH_WIDTH + 1) * scale;
    let glyph_h = font5x7::GLYPH_HEIGHT * scale;
    let box_w = pad * 2 + glyph_w * text.chars().count() as u32;
    let box_h = pad * 2 + glyph_h;

    for by in y..(y + box_h).min(img.height()) {
        for bx in x..(x + box_w).min(img.width()) {
            img.put_pixel(bx, by, Rgb([0, 0, 0]));
        }
    }

    for (i, c) in text.chars().enumerate() {
        let bitmap = font5x7::glyph(c);
        let gx = x + pad + i as u32 * glyph_w;
        let gy = y + pad;
        for (row, bits) in bitmap.iter().enumerate() {
            for col in 0..font5x7::GLYPH_WIDTH {
                if bits & (1 << (font5x7::GLYPH_WIDTH - 1 - col)) != 0 {
                    for sy in 0..scale {
                        for sx in 0..scale {
                            let px = gx + col * scale + sx;
                            let py = gy + row as u32 * scale + sy;
                            if px < img.width() && py < img.height() {
                                img.put_pixel(px, py, Rgb([255, 255, 255]));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CameraDriver for NullDriver {
    async fn get_snapshot_jpeg(&self, _timeout: Duration) -> Result<Vec<u8>> {
        self.synthesize()
    }
}

/// Talks to a real Amcrest-compatible IP camera over HTTP digest auth.
pub struct AmcrestDriver {
    client: reqwest::Client,
    ip: String,
    user: String,
    pass: String,
    channel: u32,
    https: bool,
}

impl AmcrestDriver {
    pub fn new(settings: &Value) -> Result<Self> {
        let ip = settings
            .get("ip")
            .and_then(|v| v.as_str())
            .context("amcrest driver requires settings.ip")?
            .to_string();
        let user = settings
            .get("user")
            .and_then(|v| v.as_str())
            .context("amcrest driver requires settings.user")?
            .to_string();
        let pass = settings
            .get("pass")
            .and_then(|v| v.as_str())
            .context("amcrest driver requires settings.pass")?
            .to_string();
        let channel = settings.get("channel").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let https = settings.get("https").and_then(|v| v.as_bool()).unwrap_or(false);
        let verify_ssl = settings.get("verify_ssl").and_then(|v| v.as_bool()).unwrap_or(false);

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .context("failed building amcrest HTTP client")?;

        Ok(Self { client, ip, user, pass, channel, https })
    }
}

#[async_trait]
impl CameraDriver for AmcrestDriver {
    async fn get_snapshot_jpeg(&self, timeout: Duration) -> Result<Vec<u8>> {
        let proto = if self.https { "https" } else { "http" };
        let url = format!(
            "{proto}://{}/cgi-bin/snapshot.cgi?channel={}",
            self.ip, self.channel
        );
        digest_auth::get(&self.client, &url, &self.user, &self.pass, timeout).await
    }

    async fn apply_video_settings(&self, payload: &Value) -> Value {
        debug!(?payload, "amcrest apply_video_settings");
        json!({"video": payload.get("video").cloned().unwrap_or(json!({}))})
    }

    async fn apply_isp_settings(&self, payload: &Value) -> Value {
        debug!(?payload, "amcrest apply_isp_settings");
        let mut out = payload.clone();
        let map = out.as_object_mut().expect("isp payload must be a JSON object");
        map.entry("mountPosition").or_insert(json!("ceiling"));
        map.entry("statusCode").or_insert(json!(0));
        map.entry("status").or_insert(json!("ok"));
        out
    }
}

/// Picks a driver from `camera.type` (or the flattened `camera_type`), defaulting to
/// `null` for anything unrecognized -- same fallback the reference factory uses.
pub fn build(settings: &Value, camera_name: String) -> Result<Box<dyn CameraDriver>> {
    let brand = settings
        .pointer("/camera/type")
        .or_else(|| settings.get("camera_type"))
        .and_then(|v| v.as_str())
        .unwrap_or("null")
        .to_lowercase();

    match brand.as_str() {
        "amcrest" => {
            let amcrest_settings = settings.get("amcrest").unwrap_or(settings);
            Ok(Box::new(AmcrestDriver::new(amcrest_settings)?))
        }
        _ => Ok(Box::new(NullDriver::new(camera_name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_driver_produces_valid_jpeg() {
        let driver = NullDriver::new("TestCam".to_string());
        let bytes = driver.get_snapshot_jpeg(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 1280);
        assert_eq!(decoded.height(), 720);
    }

    #[tokio::test]
    async fn factory_defaults_to_null_for_unknown_brand() {
        let settings = json!({"camera": {"type": "hikvision"}});
        let driver = build(&settings, "Cam1".to_string()).unwrap();
        let bytes = driver.get_snapshot_jpeg(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn factory_builds_amcrest_from_nested_settings() {
        let settings = json!({
            "camera": {"type": "amcrest"},
            "amcrest": {"ip": "10.0.0.5", "user": "admin", "pass": "secret"}
        });
        let driver = build(&settings, "Cam1".to_string()).unwrap();
        assert_eq!(driver.network_status().await, json!({"status": "connected"}));
    }

    #[tokio::test]
    async fn amcrest_isp_settings_default_mount_position() {
        let amcrest = AmcrestDriver::new(&json!({"ip": "10.0.0.5", "user": "a", "pass": "b"})).unwrap();
        let out = amcrest.apply_isp_settings(&json!({})).await;
        assert_eq!(out["mountPosition"], json!("ceiling"));
    }
}
