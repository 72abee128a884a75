//! HTTP/1.1 Upgrade handshake (RFC 6455 §4).
//!
//! # Exchange
//!
//! 1. Client sends `GET <path>` with a random base64 `Sec-WebSocket-Key`
//! 2. Server answers `HTTP/1.1 101` with
//!    `Sec-WebSocket-Accept = base64(SHA1(key + GUID))`
//! 3. Bytes after the header terminator already belong to the frame stream

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64Standard;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// GUID appended to the key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header terminator.
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Upper bound on the response head, to fail fast on garbage.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Read chunk size while waiting for the response head.
const READ_CHUNK: usize = 1024;

// ============================================================================
// Accept Key
// ============================================================================

/// Computes the `Sec-WebSocket-Accept` value the server must return for `key`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    Base64Standard.encode(hasher.finalize())
}

// ============================================================================
// Handshake
// ============================================================================

/// One client-side upgrade attempt, bound to its nonce.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Base64 of 16 random bytes.
    key: String,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    /// Creates a handshake with a fresh random key.
    #[must_use]
    pub fn new() -> Self {
        let nonce: [u8; 16] = rand::random();
        Self {
            key: Base64Standard.encode(nonce),
        }
    }

    /// Creates a handshake with a fixed key.
    #[must_use]
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Returns the `Sec-WebSocket-Key` value.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the accept value the server must answer with.
    #[inline]
    #[must_use]
    pub fn expected_accept(&self) -> String {
        accept_key(&self.key)
    }

    /// Builds the upgrade request.
    #[must_use]
    pub fn request(&self, host: &str, port: u16, path: &str) -> String {
        format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}:{port}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            key = self.key
        )
    }

    /// Validates the response head (status line and headers, without the
    /// trailing blank line).
    ///
    /// # Errors
    ///
    /// [`Error::Handshake`] if the status is not `101` or the accept value
    /// is missing or wrong.
    pub fn validate(&self, head: &str) -> Result<()> {
        let mut lines = head.split("\r\n");
        let status = lines.next().unwrap_or_default();
        if !status.starts_with("HTTP/1.1 101") {
            return Err(Error::handshake(format!("unexpected status line: {status:?}")));
        }

        let accept = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-accept"))
            .map(|(_, value)| value.trim())
            .ok_or_else(|| Error::handshake("missing Sec-WebSocket-Accept header"))?;

        let expected = self.expected_accept();
        if accept != expected {
            return Err(Error::handshake(format!(
                "Sec-WebSocket-Accept mismatch: expected {expected}, got {accept}"
            )));
        }

        Ok(())
    }

    /// Runs the exchange on `stream` and returns any bytes received past the
    /// header terminator.
    ///
    /// Every read is bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// - [`Error::Handshake`] on an invalid response or if the socket closes
    ///   before the header terminator
    /// - [`Error::Timeout`] if `deadline` passes first
    /// - [`Error::Connection`] on socket failure
    pub async fn perform<S>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
        path: &str,
        deadline: Instant,
    ) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let request = self.request(host, port, path);
        trace!(%host, port, %path, "Sending upgrade request");

        timeout_at(deadline, stream.write_all(request.as_bytes()))
            .await
            .map_err(|_| Error::timeout("websocket handshake write", elapsed_ms()))?
            .map_err(|e| Error::connection(format!("handshake write failed: {e}")))?;

        let mut received = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        let head_end = loop {
            if let Some(pos) = find_subsequence(&received, HEADER_END) {
                break pos;
            }
            if received.len() > MAX_RESPONSE_HEAD {
                return Err(Error::handshake(format!(
                    "response head exceeds {MAX_RESPONSE_HEAD} bytes"
                )));
            }

            let n = timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| Error::timeout("websocket handshake response", elapsed_ms()))?
                .map_err(|e| Error::connection(format!("handshake read failed: {e}")))?;

            if n == 0 {
                return Err(Error::handshake(
                    "connection closed before handshake response completed",
                ));
            }
            received.extend_from_slice(&chunk[..n]);
        };

        let head = std::str::from_utf8(&received[..head_end])
            .map_err(|_| Error::handshake("response head is not valid UTF-8"))?;
        self.validate(head)?;

        let leftover = received.split_off(head_end + HEADER_END.len());
        debug!(leftover = leftover.len(), "WebSocket handshake completed");

        Ok(leftover)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    // RFC 6455 §1.3 sample nonce and accept value.
    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn response(accept: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             \r\n"
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn test_accept_key_matches_rfc_sample() {
        assert_eq!(accept_key(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn test_random_key_is_16_bytes() {
        let handshake = Handshake::new();
        let decoded = Base64Standard.decode(handshake.key()).expect("base64");
        assert_eq!(decoded.len(), 16);
        assert_ne!(handshake.key(), Handshake::new().key());
    }

    #[test]
    fn test_request_format() {
        let request = Handshake::with_key(SAMPLE_KEY).request("127.0.0.1", 9222, "/devtools/page/1");
        assert!(request.starts_with("GET /devtools/page/1 HTTP/1.1\r\n"));
        assert!(request.contains("Host: 127.0.0.1:9222\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Connection: Upgrade\r\n"));
        assert!(request.contains(&format!("Sec-WebSocket-Key: {SAMPLE_KEY}\r\n")));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_validate_accepts_only_exact_value() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        let good = response(SAMPLE_ACCEPT);
        assert!(handshake.validate(good.trim_end()).is_ok());

        let bad = response("AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        let err = handshake.validate(bad.trim_end()).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_validate_header_name_case_insensitive() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        let head = format!("HTTP/1.1 101 Switching Protocols\r\nsec-websocket-accept:{SAMPLE_ACCEPT}");
        assert!(handshake.validate(&head).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_101() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        let head = format!("HTTP/1.1 200 OK\r\nSec-WebSocket-Accept: {SAMPLE_ACCEPT}");
        assert!(matches!(handshake.validate(&head), Err(Error::Handshake { .. })));
    }

    #[test]
    fn test_validate_rejects_missing_accept() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        assert!(handshake.validate("HTTP/1.1 101 Switching Protocols").is_err());
    }

    #[tokio::test]
    async fn test_perform_returns_leftover_bytes() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        let mut reply = response(SAMPLE_ACCEPT).into_bytes();
        reply.extend_from_slice(&[0x81, 0x02, b'h', b'i']);

        let mut stream = tokio_test::io::Builder::new()
            .write(handshake.request("localhost", 9222, "/").as_bytes())
            .read(&reply)
            .build();

        let leftover = handshake
            .perform(&mut stream, "localhost", 9222, "/", deadline())
            .await
            .expect("handshake");
        assert_eq!(leftover, vec![0x81, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_perform_handles_split_response() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        let reply = response(SAMPLE_ACCEPT);
        let (a, b) = reply.as_bytes().split_at(20);

        let mut stream = tokio_test::io::Builder::new()
            .write(handshake.request("localhost", 9222, "/").as_bytes())
            .read(a)
            .read(b)
            .build();

        let leftover = handshake
            .perform(&mut stream, "localhost", 9222, "/", deadline())
            .await
            .expect("handshake");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_perform_fails_when_socket_closes_early() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        let mut stream = tokio_test::io::Builder::new()
            .write(handshake.request("localhost", 9222, "/").as_bytes())
            .read(b"HTTP/1.1 101 Switching")
            .build();

        let err = handshake
            .perform(&mut stream, "localhost", 9222, "/", deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_perform_rejects_bad_accept() {
        let handshake = Handshake::with_key(SAMPLE_KEY);
        let mut stream = tokio_test::io::Builder::new()
            .write(handshake.request("localhost", 9222, "/").as_bytes())
            .read(response("bm90IHRoZSByaWdodCB2YWx1ZQ==").as_bytes())
            .build();

        let err = handshake
            .perform(&mut stream, "localhost", 9222, "/", deadline())
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
    }
}
