//! Processor webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac-sha256>[,v1=...]`. The
//! signed payload is `"<t>.<raw body>"`. Several `v1` entries may be
//! present while the processor rotates secrets; any match is accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature header has no timestamp")]
    MissingTimestamp,

    #[error("Signature header has no v1 signature")]
    MissingSignature,

    #[error("Signature timestamp outside tolerance ({age_secs}s)")]
    Expired { age_secs: i64 },

    #[error("Signature does not match payload")]
    Mismatch,
}

struct ParsedHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            // Undecodable entries are skipped; they can never match.
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if signatures.is_empty() {
        return Err(SignatureError::MissingSignature);
    }
    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Verify `header` against the raw request body.
///
/// `now` is unix seconds; passing it in keeps the check deterministic.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let parsed = parse_header(header)?;

    let age_secs = (now - parsed.timestamp).abs();
    if age_secs > tolerance_secs {
        return Err(SignatureError::Expired { age_secs });
    }

    let matched = parsed.signatures.iter().any(|sig| {
        mac_for(secret, parsed.timestamp, payload)
            .verify_slice(sig)
            .is_ok()
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Build a header the way the processor does. Used by tests and local
/// tooling that replays captured events.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let signature = hex::encode(mac_for(secret, timestamp, payload).finalize().into_bytes());
    format!("t={},v1={}", timestamp, signature)
}
