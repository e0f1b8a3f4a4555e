//! Stripe webhook signature verification
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...][,v0=...]`. The
//! signed message is `"{t}." + raw body`, keyed with the endpoint secret.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[redacted]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Check `header` against `payload` as of `now` (unix seconds)
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> BillingResult<()> {
        if self.secret.is_empty() {
            tracing::error!("Webhook secret is not configured, rejecting event");
            return Err(BillingError::InvalidSignature);
        }

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", v)) => timestamp = v.parse().ok(),
                Some(("v1", v)) => candidates.push(v),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::InvalidSignature
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::InvalidSignature);
        }

        let age = now.abs_diff(timestamp);
        if age > self.tolerance.as_secs() {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                age_secs = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::InvalidSignature);
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::InvalidSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::InvalidSignature);
        }
        Ok(())
    }
}

/// Build a valid `Stripe-Signature` header for `payload`
#[cfg(any(test, feature = "testing"))]
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_unit";
    const NOW: i64 = 1_700_000_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET, Duration::from_secs(300))
    }

    #[test]
    fn accepts_fresh_valid_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(SECRET, NOW - 10, body);
        assert!(verifier().verify(body, &header, NOW).is_ok());
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let body = br#"{"id":"evt_1"}"#;
        let good = sign(SECRET, NOW, body);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1=deadbeef,v1={good_sig},v0=abc");
        assert!(verifier().verify(body, &header, NOW).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_wrong_secret() {
        let header = sign(SECRET, NOW, b"original");
        assert!(matches!(
            verifier().verify(b"tampered", &header, NOW),
            Err(BillingError::InvalidSignature)
        ));

        let other = sign("whsec_other", NOW, b"original");
        assert!(verifier().verify(b"original", &other, NOW).is_err());
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let body = b"{}";
        let stale = sign(SECRET, NOW - 301, body);
        assert!(verifier().verify(body, &stale, NOW).is_err());

        let future = sign(SECRET, NOW + 301, body);
        assert!(verifier().verify(body, &future, NOW).is_err());
    }

    #[test]
    fn rejects_malformed_headers() {
        let v = verifier();
        assert!(v.verify(b"{}", "", NOW).is_err());
        assert!(v.verify(b"{}", "v1=abcd", NOW).is_err());
        assert!(v.verify(b"{}", &format!("t={NOW}"), NOW).is_err());
        assert!(v.verify(b"{}", &format!("t={NOW},v1=zz-not-hex"), NOW).is_err());
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let v = SignatureVerifier::new("", Duration::from_secs(300));
        let header = sign("", NOW, b"{}");
        assert!(v.verify(b"{}", &header, NOW).is_err());
    }
}
