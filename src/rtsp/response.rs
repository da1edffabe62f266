//! Inbound RTSP responses (RFC 2326 §7).
//!
//! Parsing is split in two because responses arrive over a streaming
//! socket: [`RtspResponse::parse_head`] consumes the status line and
//! headers once a blank line has been buffered, and reports how many body
//! bytes (if any) still need to be read before [`RtspResponse`] is
//! complete. This mirrors the teacher's `Connection::run` read-line-until-blank
//! loop in `transport/tcp.rs`, just consuming a response instead of a
//! request.

use crate::error::{ParseErrorKind, RelayError, Result};

/// A parsed RTSP response.
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    /// Parse the status line and headers from `head` (everything up to and
    /// including the blank line that ends the header block). Returns the
    /// response (with `body: None`) and the `Content-Length` to read next,
    /// if any.
    pub fn parse_head(head: &str) -> Result<(Self, usize)> {
        let mut lines = head.lines();

        let status_line = lines.next().ok_or(RelayError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let code = parts.next();
        let text = parts.next().unwrap_or("");

        if !version.starts_with("RTSP/") || code.is_none() {
            return Err(RelayError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            });
        }
        let status_code: u16 = code
            .unwrap()
            .parse()
            .map_err(|_| RelayError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            })?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line.find(':').ok_or(RelayError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            let name = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            headers.push((name, value));
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| RelayError::Parse {
                        kind: ParseErrorKind::InvalidContentLength,
                    })
            })
            .transpose()?
            .unwrap_or(0);

        Ok((
            RtspResponse {
                status_code,
                status_text: text.to_string(),
                headers,
                body: None,
            },
            content_length,
        ))
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u64> {
        self.get_header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_auth_challenge(&self) -> bool {
        self.status_code == 401 || self.status_code == 407
    }

    /// `Session` header value with the `;timeout=N` suffix stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// `timeout=N` parameter from the `Session` header, if advertised.
    pub fn session_timeout_secs(&self) -> Option<u64> {
        self.get_header("Session")?
            .split(';')
            .find_map(|part| part.trim().strip_prefix("timeout="))
            .and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ok_with_no_body() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: OPTIONS, DESCRIBE\r\n\r\n";
        let (resp, len) = RtspResponse::parse_head(raw).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.cseq(), Some(1));
        assert_eq!(len, 0);
    }

    #[test]
    fn parses_content_length_for_body() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: 42\r\n\r\n";
        let (_, len) = RtspResponse::parse_head(raw).unwrap();
        assert_eq!(len, 42);
    }

    #[test]
    fn parses_401_challenge() {
        let raw = "RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"x\", nonce=\"y\"\r\n\r\n";
        let (resp, _) = RtspResponse::parse_head(raw).unwrap();
        assert!(resp.is_auth_challenge());
        assert!(!resp.is_success());
    }

    #[test]
    fn session_id_strips_timeout_suffix() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 12345678;timeout=60\r\n\r\n";
        let (resp, _) = RtspResponse::parse_head(raw).unwrap();
        assert_eq!(resp.session_id(), Some("12345678"));
        assert_eq!(resp.session_timeout_secs(), Some(60));
    }

    #[test]
    fn rejects_empty_message() {
        assert!(RtspResponse::parse_head("").is_err());
    }

    #[test]
    fn rejects_non_rtsp_status_line() {
        assert!(RtspResponse::parse_head("HTTP/1.1 200 OK\r\n\r\n").is_err());
    }
}
