//! Hand-rolled HTTP Digest authentication (RFC 2617) for the Amcrest driver's snapshot
//! fetch. No crate in the dependency stack covers this, so it's built directly on the
//! `md-5`/`hex` crates already pulled in for other purposes, following the two-round-trip
//! shape `requests.auth.HTTPDigestAuth` uses in the reference driver.

use anyhow::{Context, Result, anyhow};
use md5::{Digest, Md5};
use rand::RngCore;
use std::collections::HashMap;
use std::time::Duration;

struct Challenge {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parses a `WWW-Authenticate: Digest ...` header value into its component fields.
fn parse_challenge(header: &str) -> Result<Challenge> {
    let rest = header
        .trim()
        .strip_prefix("Digest ")
        .ok_or_else(|| anyhow!("not a Digest challenge: {header}"))?;

    let mut fields = HashMap::new();
    for part in split_header_params(rest) {
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim().trim_matches('"').to_string();
            fields.insert(k.trim().to_string(), v);
        }
    }

    Ok(Challenge {
        realm: fields
            .get("realm")
            .cloned()
            .ok_or_else(|| anyhow!("digest challenge missing realm"))?,
        nonce: fields
            .get("nonce")
            .cloned()
            .ok_or_else(|| anyhow!("digest challenge missing nonce"))?,
        qop: fields.get("qop").cloned(),
        opaque: fields.get("opaque").cloned(),
    })
}

/// Splits on commas that aren't inside a quoted value.
fn split_header_params(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Performs a digest-authenticated GET against `url`. Mirrors `requests`' flow: an
/// unauthenticated probe request reads the challenge from the 401, then a single
/// authenticated retry carries the computed response digest.
pub async fn get(
    client: &reqwest::Client,
    url: &str,
    user: &str,
    pass: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let probe = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .context("digest auth probe request failed")?;

    if probe.status() != reqwest::StatusCode::UNAUTHORIZED {
        let status = probe.status();
        return if status.is_success() {
            Ok(probe.bytes().await?.to_vec())
        } else {
            Err(anyhow!("unexpected status from snapshot endpoint: {status}"))
        };
    }

    let www_authenticate = probe
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow!("401 response carried no WWW-Authenticate header"))?
        .to_string();
    let challenge = parse_challenge(&www_authenticate)?;

    let parsed = reqwest::Url::parse(url).context("invalid snapshot URL")?;
    let uri = format!(
        "{}{}",
        parsed.path(),
        parsed.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let ha1 = md5_hex(&format!("{user}:{}:{pass}", challenge.realm));
    let ha2 = md5_hex(&format!("GET:{uri}"));

    let (auth_header, _) = if let Some(qop) = &challenge.qop {
        let qop = qop.split(',').next().unwrap_or("auth").trim().to_string();
        let nc = "00000001";
        let cnonce = cnonce();
        let response = md5_hex(&format!(
            "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
            challenge.nonce
        ));
        let mut header = format!(
            "Digest username=\"{user}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", \
             response=\"{response}\", qop={qop}, nc={nc}, cnonce=\"{cnonce}\"",
            challenge.realm, challenge.nonce
        );
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        (header, response)
    } else {
        let response = md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce));
        let mut header = format!(
            "Digest username=\"{user}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
            challenge.realm, challenge.nonce
        );
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        (header, response)
    };

    let resp = client
        .get(url)
        .timeout(timeout)
        .header(reqwest::header::AUTHORIZATION, auth_header)
        .send()
        .await
        .context("digest auth authenticated request failed")?;

    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("snapshot fetch failed with status {status}"));
    }
    Ok(resp.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_realm_nonce_qop_opaque() {
        let header =
            r#"Digest realm="IPC", qop="auth", nonce="abc123", opaque="xyz", algorithm=MD5"#;
        let challenge = parse_challenge(header).unwrap();
        assert_eq!(challenge.realm, "IPC");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn rejects_non_digest_header() {
        assert!(parse_challenge("Basic realm=\"x\"").is_err());
    }

    #[test]
    fn md5_hex_matches_known_vector() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
