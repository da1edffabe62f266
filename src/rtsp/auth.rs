//! Basic and Digest authentication (RFC 2069 / RFC 2326 §18.16).
//!
//! The teacher crate never needed this (a server answers auth challenges,
//! it doesn't issue them); grounded instead on the RTSP-camera digest math
//! used throughout `other_examples/manifests/thirtythreeforty-neolink`,
//! which is why `md5` is a dependency here rather than the teacher's.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone)]
enum Challenge {
    Basic,
    Digest { realm: String, nonce: String },
}

/// Builds `Authorization` headers in response to a server's
/// `WWW-Authenticate` challenge. Retried at most once per request: if the
/// server still answers 401/407 after a fresh `Authorization` header, the
/// credentials are wrong and the relay gives up (§4.1).
#[derive(Debug, Clone)]
pub struct Authenticator {
    user: String,
    pass: String,
    challenge: Option<Challenge>,
}

impl Authenticator {
    pub fn new(user: String, pass: String) -> Self {
        Authenticator {
            user,
            pass,
            challenge: None,
        }
    }

    /// Parse a `WWW-Authenticate` (or `Proxy-Authenticate`) header value and
    /// remember it for the next `authorization_header` call.
    pub fn update_challenge(&mut self, header_value: &str) -> Result<()> {
        let header_value = header_value.trim();
        if let Some(params) = header_value.strip_prefix("Digest ") {
            let realm = extract_param(params, "realm")
                .ok_or_else(|| RelayError::AuthenticationFailed)?;
            let nonce = extract_param(params, "nonce")
                .ok_or_else(|| RelayError::AuthenticationFailed)?;
            self.challenge = Some(Challenge::Digest { realm, nonce });
            Ok(())
        } else if header_value.starts_with("Basic") {
            self.challenge = Some(Challenge::Basic);
            Ok(())
        } else {
            Err(RelayError::AuthenticationFailed)
        }
    }

    /// Build the `Authorization` header value for `method`/`uri` using
    /// whatever challenge was last recorded.
    pub fn authorization_header(&self, method: &str, uri: &str) -> Option<String> {
        match self.challenge.as_ref()? {
            Challenge::Basic => {
                let raw = format!("{}:{}", self.user, self.pass);
                Some(format!("Basic {}", BASE64.encode(raw)))
            }
            Challenge::Digest { realm, nonce } => {
                let ha1 = md5_hex(format!("{}:{}:{}", self.user, realm, self.pass));
                let ha2 = md5_hex(format!("{method}:{uri}"));
                let response = md5_hex(format!("{ha1}:{nonce}:{ha2}"));
                Some(format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                    self.user, realm, nonce, uri, response
                ))
            }
        }
    }
}

fn md5_hex(input: String) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Pull `key="value"` (or `key=value`) out of a comma-separated
/// challenge-parameter list.
fn extract_param(params: &str, key: &str) -> Option<String> {
    for part in params.split(',') {
        let part = part.trim();
        let Some(rest) = part.strip_prefix(key) else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim();
        let value = rest.trim_matches('"');
        return Some(value.to_string());
    }
    None
}
