//! Signed webhook intake: bounded body read and HMAC-SHA256 verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::ConfirmationError;

type HmacSha256 = Hmac<Sha256>;

/// Signature header carried by every webhook delivery.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Event types that confirm a payment. Everything else is acknowledged and ignored.
pub const FULFILLING_EVENTS: [&str; 2] = [
    "checkout.session.completed",
    "checkout.session.async_payment_succeeded",
];

pub fn is_fulfilling_event(event_type: &str) -> bool {
    FULFILLING_EVENTS.contains(&event_type)
}

/// Read a webhook body, refusing anything above `limit` bytes.
///
/// A declared `content_length` over the limit is rejected before reading.
/// Otherwise the stream is capped at `limit + 1` bytes so an undeclared or
/// lying sender cannot push more than that into memory.
pub async fn read_payload<R>(
    reader: R,
    content_length: Option<u64>,
    limit: usize,
) -> Result<Vec<u8>, ConfirmationError>
where
    R: AsyncRead + Unpin,
{
    if let Some(len) = content_length
        && len > limit as u64
    {
        return Err(ConfirmationError::PayloadTooLarge { limit });
    }

    let mut buf = Vec::with_capacity(content_length.map_or(0, |l| l as usize));
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ConfirmationError::Io(e.to_string()))?;
    if buf.len() > limit {
        return Err(ConfirmationError::PayloadTooLarge { limit });
    }
    Ok(buf)
}

struct SignatureHeader<'a> {
    timestamp: i64,
    raw_timestamp: &'a str,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, ConfirmationError> {
    let mut raw_timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => raw_timestamp = Some(value),
            // Undecodable candidates are skipped; another v1 may still match.
            "v1" => {
                if let Ok(sig) = hex::decode(value) {
                    signatures.push(sig);
                }
            }
            _ => {}
        }
    }
    let raw_timestamp = raw_timestamp.ok_or(ConfirmationError::MalformedSignature)?;
    let timestamp = raw_timestamp
        .parse()
        .map_err(|_| ConfirmationError::MalformedSignature)?;
    if signatures.is_empty() {
        return Err(ConfirmationError::MalformedSignature);
    }
    Ok(SignatureHeader {
        timestamp,
        raw_timestamp,
        signatures,
    })
}

/// Check `header` against `payload`. `now_secs` and `tolerance_secs` are unix seconds.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_secs: i64,
    tolerance_secs: i64,
) -> Result<(), ConfirmationError> {
    let parsed = parse_header(header)?;
    // The header timestamp is untrusted; abs_diff cannot overflow.
    if now_secs.abs_diff(parsed.timestamp) > tolerance_secs.unsigned_abs() {
        return Err(ConfirmationError::StaleTimestamp);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ConfirmationError::MalformedSignature)?;
    mac.update(parsed.raw_timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    // verify_slice compares in constant time.
    if parsed
        .signatures
        .iter()
        .any(|sig| mac.clone().verify_slice(sig).is_ok())
    {
        Ok(())
    } else {
        Err(ConfirmationError::SignatureMismatch)
    }
}

/// Build a header for `payload` the way the provider does. Used by tests and the bench.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_748_880_000;

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"type":"checkout.session.completed"}"#;
        let header = sign(body, SECRET, NOW);
        assert!(verify_signature(body, &header, SECRET, NOW + 10, 300).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign(b"original", SECRET, NOW);
        assert_eq!(
            verify_signature(b"tampered", &header, SECRET, NOW, 300),
            Err(ConfirmationError::SignatureMismatch)
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign(b"body", "other", NOW);
        assert_eq!(
            verify_signature(b"body", &header, SECRET, NOW, 300),
            Err(ConfirmationError::SignatureMismatch)
        );
    }

    #[test]
    fn stale_timestamp_rejected_even_when_signed() {
        let header = sign(b"body", SECRET, NOW - 301);
        assert_eq!(
            verify_signature(b"body", &header, SECRET, NOW, 300),
            Err(ConfirmationError::StaleTimestamp)
        );
        let header = sign(b"body", SECRET, NOW - 300);
        assert!(verify_signature(b"body", &header, SECRET, NOW, 300).is_ok());
    }

    #[test]
    fn extreme_timestamps_are_stale_not_a_panic() {
        for t in [i64::MIN, i64::MIN + 1, i64::MAX, -1, 0] {
            let header = format!("t={t},v1=00");
            assert_eq!(
                verify_signature(b"{}", &header, SECRET, NOW, 300),
                Err(ConfirmationError::StaleTimestamp),
                "t={t}"
            );
            let header = sign(b"{}", SECRET, t);
            assert_eq!(
                verify_signature(b"{}", &header, SECRET, NOW, 300),
                Err(ConfirmationError::StaleTimestamp),
                "signed t={t}"
            );
        }
        let header = sign(b"{}", SECRET, NOW + 300);
        assert_eq!(verify_signature(b"{}", &header, SECRET, NOW, 300), Ok(()));
    }

    #[test]
    fn any_matching_v1_is_accepted() {
        let good = sign(b"body", SECRET, NOW);
        let good_sig = good.split_once(",v1=").unwrap().1;
        let header = format!("t={NOW},v1=deadbeef,v1=zz,v1={good_sig}");
        assert!(verify_signature(b"body", &header, SECRET, NOW, 300).is_ok());
    }

    #[test]
    fn malformed_headers() {
        for header in ["", "v1=abcd", "t=abc,v1=abcd", "t=1", "t=1,v1=nothex"] {
            assert_eq!(
                verify_signature(b"body", header, SECRET, NOW, 300),
                Err(ConfirmationError::MalformedSignature),
                "header {header:?}"
            );
        }
    }

    #[test]
    fn fulfilling_event_filter() {
        assert!(is_fulfilling_event("checkout.session.completed"));
        assert!(is_fulfilling_event("checkout.session.async_payment_succeeded"));
        assert!(!is_fulfilling_event("checkout.session.expired"));
        assert!(!is_fulfilling_event("payment_intent.succeeded"));
    }

    #[tokio::test]
    async fn payload_within_limit_is_read() {
        let body = vec![b'x'; 64];
        let read = read_payload(&body[..], Some(64), 64).await.unwrap();
        assert_eq!(read.len(), 64);
    }

    #[tokio::test]
    async fn declared_length_over_limit_rejected_before_read() {
        let body = vec![b'x'; 8];
        assert_eq!(
            read_payload(&body[..], Some(1_000_000), 64).await,
            Err(ConfirmationError::PayloadTooLarge { limit: 64 })
        );
    }

    #[tokio::test]
    async fn undeclared_oversized_stream_rejected() {
        let body = vec![b'x'; 65];
        assert_eq!(
            read_payload(&body[..], None, 64).await,
            Err(ConfirmationError::PayloadTooLarge { limit: 64 })
        );
    }

    #[tokio::test]
    async fn understated_length_still_capped() {
        let body = vec![b'x'; 1_000];
        assert_eq!(
            read_payload(&body[..], Some(10), 64).await,
            Err(ConfirmationError::PayloadTooLarge { limit: 64 })
        );
    }
}
