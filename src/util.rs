use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Single-producer, multi-consumer wake signal between the adoption server (C5) and the
/// WSS manager (C7): fired once per successful adoption POST, per SPEC_FULL.md §4.3/§4.5.
#[derive(Clone)]
pub struct TokenEvent(std::sync::Arc<tokio::sync::Notify>);

impl TokenEvent {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(tokio::sync::Notify::new()))
    }

    pub fn notify(&self) {
        self.0.notify_waiters();
    }

    pub async fn wait_timeout(&self, dur: std::time::Duration) {
        let _ = tokio::time::timeout(dur, self.0.notified()).await;
    }
}

impl Default for TokenEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `host:port`, defaulting to port 7442 when the port is missing or non-numeric.
pub fn parse_hostport(hostport: &str) -> (String, u16) {
    match hostport.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (host.to_string(), 7442),
        },
        None => (hostport.to_string(), 7442),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        assert_eq!(parse_hostport("10.0.0.1:7442"), ("10.0.0.1".to_string(), 7442));
    }

    #[test]
    fn defaults_port_when_missing() {
        assert_eq!(parse_hostport("10.0.0.1"), ("10.0.0.1".to_string(), 7442));
    }

    #[test]
    fn defaults_port_when_non_numeric() {
        assert_eq!(parse_hostport("10.0.0.1:nope"), ("10.0.0.1".to_string(), 7442));
    }
}
