//! ONVIF discovery convenience (`--discover-onvif`): unrelated to the emulator's own
//! discovery responder, this is an operator tool for finding real ONVIF-speaking hardware
//! on the LAN when deciding what marketName/driver to emulate. Retained from the teacher
//! almost verbatim.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::net::UdpSocket;
use tokio::time::{Duration, timeout};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveredCamera {
    pub endpoint: String,
    pub from: String,
}

pub async fn discover_onvif(timeout_secs: u64) -> Result<Vec<DiscoveredCamera>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let probe = build_probe_xml();

    socket
        .send_to(probe.as_bytes(), "239.255.255.250:3702")
        .await?;

    let mut seen = HashMap::<String, String>::new();
    let deadline = Duration::from_secs(timeout_secs.max(1));
    let mut buf = vec![0u8; 16 * 1024];

    while let Ok(recv) = timeout(deadline, socket.recv_from(&mut buf)).await {
        match recv {
            Ok((len, from)) => {
                let payload = String::from_utf8_lossy(&buf[..len]);
                for xaddr in extract_xaddrs(&payload) {
                    seen.entry(xaddr).or_insert_with(|| from.to_string());
                }
            }
            Err(_) => break,
        }
    }

    let out = seen
        .into_iter()
        .map(|(endpoint, from)| DiscoveredCamera { endpoint, from })
        .collect::<Vec<_>>();

    Ok(out)
}

fn build_probe_xml() -> String {
    format!(
        r#"<?xml version=\"1.0\" encoding=\"UTF-8\"?>
<e:Envelope xmlns:e=\"http://www.w3.org/2003/05/soap-envelope\"
            xmlns:w=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\"
            xmlns:d=\"http://schemas.xmlsoap.org/ws/2005/04/discovery\"
            xmlns:dn=\"http://www.onvif.org/ver10/network/wsdl\">
  <e:Header>
    <w:MessageID>uuid:{}</w:MessageID>
    <w:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</w:To>
    <w:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</w:Action>
  </e:Header>
  <e:Body>
    <d:Probe>
      <d:Types>dn:NetworkVideoTransmitter</d:Types>
    </d:Probe>
  </e:Body>
</e:Envelope>"#,
        uuid::Uuid::new_v4()
    )
}

fn extract_xaddrs(xml: &str) -> Vec<String> {
    let re = Regex::new(r"<[^>]*XAddrs[^>]*>([^<]+)</[^>]*XAddrs>").expect("regex");
    let mut out = Vec::new();
    for cap in re.captures_iter(xml) {
        if let Some(m) = cap.get(1) {
            for entry in m.as_str().split_whitespace() {
                if entry.starts_with("http://") || entry.starts_with("https://") {
                    out.push(entry.to_string());
                }
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_xaddr() {
        let xml = "<XAddrs>http://10.0.0.2/onvif/device_service https://10.0.0.2/ws</XAddrs>";
        let out = extract_xaddrs(xml);
        assert_eq!(out.len(), 2);
    }
}
