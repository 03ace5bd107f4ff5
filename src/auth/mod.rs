use crate::config::AUTH_WINDOW_SECS;
use base64::Engine;
use hmac::{Hmac, Mac};
use regex::bytes::Regex;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Compute the signature a client must present for `cid` at timestamp `ts`:
/// the lowercase hex HMAC-SHA256 over `cid || ts`.
pub fn sign(secret: &[u8], cid: &str, ts: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(cid.as_bytes());
    mac.update(ts.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Extracts and verifies the `cid:ts:sig` credential carried by a CONNECT
/// request, in either of its two transport envelopes.
pub struct Authenticator {
    secret: Vec<u8>,
    auth_header: Regex,
    proxy_auth_header: Regex,
}

impl Authenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            auth_header: Regex::new(r"(?i)x-pg-auth:\s*([^\r\n]+)").expect("valid regex"),
            proxy_auth_header: Regex::new(r"(?i)proxy-authorization:\s*basic\s+([^\r\n\s]+)")
                .expect("valid regex"),
        }
    }

    /// Extract the auth string from a raw header block.
    ///
    /// `x-pg-auth` wins when both headers are present; the Basic form is
    /// decoded so clients restricted to standard proxy credentials can still
    /// carry the same `cid:ts:sig` payload.
    pub fn parse(&self, header_block: &[u8]) -> Option<String> {
        if let Some(caps) = self.auth_header.captures(header_block) {
            let val = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
            debug!("auth: found x-pg-auth header");
            return Some(val.trim().to_string());
        }

        if let Some(caps) = self.proxy_auth_header.captures(header_block) {
            let token = caps.get(1)?.as_bytes();
            match base64::engine::general_purpose::STANDARD
                .decode(token)
                .map_err(|e| e.to_string())
                .and_then(|raw| String::from_utf8(raw).map_err(|e| e.to_string()))
            {
                Ok(decoded) => {
                    debug!("auth: decoded proxy-authorization header");
                    return Some(decoded);
                }
                Err(e) => {
                    warn!("auth: failed to decode proxy-authorization: {}", e);
                }
            }
        }
        None
    }

    /// Verify an auth string, returning validity plus the client id when one
    /// could be extracted (so failures can still be attributed in logs).
    pub fn verify(&self, auth_val: &str) -> (bool, Option<String>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.verify_at(auth_val, now)
    }

    fn verify_at(&self, auth_val: &str, now: i64) -> (bool, Option<String>) {
        // Canonical form is cid:ts:sig. A Basic credential decoded to
        // user:pass arrives in exactly the same shape, so a full colon split
        // covers both envelopes.
        let parts: Vec<&str> = auth_val.split(':').collect();
        let (cid, ts, sig) = match parts.as_slice() {
            [cid, ts, sig] => (*cid, *ts, *sig),
            [cid, _] => return (false, Some(cid.to_string())),
            _ => return (false, None),
        };

        let ts_num: i64 = match ts.parse() {
            Ok(v) => v,
            Err(_) => return (false, Some(cid.to_string())),
        };

        if (now - ts_num).abs() > AUTH_WINDOW_SECS {
            warn!("auth: timestamp expired, server={}, client={}", now, ts);
            return (false, Some(cid.to_string()));
        }

        let expected = sign(&self.secret, cid, ts_num);
        if expected.as_bytes().ct_eq(sig.as_bytes()).unwrap_u8() != 1 {
            warn!("auth: signature mismatch, client_id={}", cid);
            return (false, Some(cid.to_string()));
        }

        (true, Some(cid.to_string()))
    }
}
