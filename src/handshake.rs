//! WebSocket opening handshake
//!
//! Sans-I/O negotiation for both roles:
//! - [`ClientHandshake`] turns a caller-supplied `http::Request` template into
//!   an upgrade request and validates the server's answer
//! - [`ServerHandshake`] validates an upgrade request and produces the
//!   `101 Switching Protocols` response
//!
//! The connection layer moves the bytes.

use std::time::Duration;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::{Error, Result};
use crate::mask::fill_random;

/// Maximum HTTP header size (8KB should be enough for any reasonable request)
pub const MAX_HEADER_SIZE: usize = 8192;

/// Only protocol version spoken
pub const WS_VERSION: &str = "13";

/// Per-request handshake deadline
///
/// Insert into the request template's extensions to override
/// `Config::handshake_timeout` for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimeout(pub Duration);

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept.trim()
}

/// Generate a random WebSocket key (client-side)
///
/// 16 bytes from the OS CSPRNG, base64 encoded.
pub fn generate_key() -> Result<String> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Whether a Sec-WebSocket-Key is 16 bytes of base64
fn is_valid_key(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key.trim())
        .map(|raw| raw.len() == 16)
        .unwrap_or(false)
}

/// Whether a comma-separated header contains `token` (case-insensitive)
fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value.to_str().is_ok_and(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    })
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Split a Sec-WebSocket-Protocol header into its tokens
fn protocol_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Classify a request as a WebSocket upgrade
///
/// Servers use this to decide between handing the connection to the engine
/// and answering with an ordinary HTTP error.
pub fn is_websocket_request<B>(request: &Request<B>) -> bool {
    validate_upgrade_request(request).is_ok()
}

fn validate_upgrade_request<B>(request: &Request<B>) -> Result<&str> {
    if request.method() != Method::GET {
        return Err(Error::InvalidHttp("method must be GET"));
    }

    let headers = request.headers();
    if !header_has_token(headers, header::UPGRADE, "websocket") {
        return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
    }
    if !header_has_token(headers, header::CONNECTION, "upgrade") {
        return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
    }
    let key = header_str(headers, header::SEC_WEBSOCKET_KEY)
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;
    if !is_valid_key(key) {
        return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Key"));
    }
    let version = header_str(headers, header::SEC_WEBSOCKET_VERSION)
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Version"))?;
    if version.trim() != WS_VERSION {
        return Err(Error::HandshakeFailed("unsupported WebSocket version"));
    }

    Ok(key.trim())
}

/// Parse a raw HTTP upgrade request
///
/// Returns the request and the number of bytes consumed, or `None` while the
/// header block is still incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let mut builder = Request::builder()
                .method(req.method.unwrap_or("GET"))
                .uri(req.path.unwrap_or("/"));

            for h in req.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| Error::InvalidHttp("invalid header name"))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                builder = builder.header(name, value);
            }

            let request = builder
                .body(())
                .map_err(|_| Error::InvalidHttp("invalid request line"))?;
            Ok(Some((request, len)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(Error::InvalidHttp("request too large"));
            }
            Ok(None)
        }
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
    }
}

/// Build a WebSocket upgrade response
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// WebSocket handshake response (client-side parsing)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
}

/// Parse a WebSocket upgrade response (client-side)
///
/// Returns the response and the number of bytes consumed, or `None` while
/// the header block is still incomplete.
pub fn parse_response(buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = res.code.unwrap_or(0);
            let mut map = HeaderMap::with_capacity(res.headers.len());
            for h in res.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| Error::InvalidHttp("invalid header name"))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                map.append(name, value);
            }
            Ok(Some((
                HandshakeResponse {
                    status,
                    headers: map,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(Error::InvalidHttp("response too large"));
            }
            Ok(None)
        }
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
    }
}

/// Client side of the opening handshake
#[derive(Debug)]
pub struct ClientHandshake {
    request: Request<()>,
    key: String,
    offered: Vec<String>,
    timeout: Option<Duration>,
}

impl ClientHandshake {
    /// Build the upgrade request from a caller template
    ///
    /// The template keeps its URI and any extra headers. Required WebSocket
    /// headers are injected, overriding whatever the template carried for
    /// them. `protocols` is sent as `Sec-WebSocket-Protocol` unless the
    /// template already names its own; `origin` is added when the template
    /// has no `Origin`.
    pub fn new(mut request: Request<()>, protocols: &[String], origin: Option<&str>) -> Result<Self> {
        if request.method() != Method::GET {
            return Err(Error::InvalidHttp("method must be GET"));
        }

        let key = generate_key()?;
        let host = request.uri().authority().map(|a| a.as_str().to_string());
        let timeout = request.extensions().get::<HandshakeTimeout>().map(|t| t.0);

        let headers = request.headers_mut();
        if !headers.contains_key(header::HOST) {
            let host = host.ok_or(Error::InvalidHttp("request has no host"))?;
            headers.insert(header::HOST, to_header_value(&host)?);
        }
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_KEY, to_header_value(&key)?);
        headers.insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WS_VERSION),
        );
        if !headers.contains_key(header::SEC_WEBSOCKET_PROTOCOL) && !protocols.is_empty() {
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                to_header_value(&protocols.join(", "))?,
            );
        }
        if let Some(origin) = origin
            && !headers.contains_key(header::ORIGIN)
        {
            headers.insert(header::ORIGIN, to_header_value(origin)?);
        }

        let offered = protocol_tokens(request.headers());

        Ok(Self {
            request,
            key,
            offered,
            timeout,
        })
    }

    /// The Sec-WebSocket-Key sent with the request
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The final upgrade request
    pub fn request(&self) -> &Request<()> {
        &self.request
    }

    /// Deadline override carried by the request template
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Serialize the request as HTTP/1.1
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512);

        let path = self
            .request
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        buf.put_slice(b"GET ");
        buf.put_slice(path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        for (name, value) in self.request.headers() {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Validate the server's response
    ///
    /// Returns the negotiated subprotocol. Any deviation is a handshake
    /// failure; nothing is tolerated.
    pub fn finish(&self, response: &HandshakeResponse) -> Result<Option<String>> {
        if response.status != 101 {
            return Err(Error::HandshakeFailed("expected 101 Switching Protocols"));
        }

        let headers = &response.headers;
        if !header_has_token(headers, header::UPGRADE, "websocket") {
            return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
        }
        if !header_has_token(headers, header::CONNECTION, "upgrade") {
            return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
        }

        let accept = header_str(headers, header::SEC_WEBSOCKET_ACCEPT)
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
        if !validate_accept_key(&self.key, accept) {
            return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"));
        }

        let selected = protocol_tokens(headers);
        if selected.is_empty() {
            return Ok(None);
        }
        selected
            .into_iter()
            .find(|p| self.offered.iter().any(|o| o == p))
            .map(Some)
            .ok_or(Error::HandshakeFailed("server selected an unoffered subprotocol"))
    }
}

/// Server side of the opening handshake
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    accept_key: String,
    protocol: Option<String>,
}

impl ServerHandshake {
    /// Validate an upgrade request and negotiate a subprotocol
    ///
    /// The first protocol in the client's offer that also appears in
    /// `supported` is selected.
    pub fn new<B>(request: &Request<B>, supported: &[String]) -> Result<Self> {
        let key = validate_upgrade_request(request)?;
        let accept_key = generate_accept_key(key);

        let protocol = protocol_tokens(request.headers())
            .into_iter()
            .find(|p| supported.iter().any(|s| s == p));

        Ok(Self {
            accept_key,
            protocol,
        })
    }

    /// The computed Sec-WebSocket-Accept value
    pub fn accept_key(&self) -> &str {
        &self.accept_key
    }

    /// Negotiated subprotocol
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// The `101 Switching Protocols` response
    pub fn response(&self) -> Bytes {
        build_response(&self.accept_key, self.protocol.as_deref())
    }
}

fn to_header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::InvalidHttp("invalid header value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn template(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = generate_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_generate_key() {
        let key = generate_key().unwrap();
        assert!(is_valid_key(&key));
        assert_ne!(key, generate_key().unwrap());
    }

    #[test]
    fn test_parse_request() {
        let (req, len) = parse_request(SAMPLE_REQUEST).unwrap().unwrap();
        assert_eq!(req.uri().path(), "/chat");
        assert_eq!(
            req.headers()[header::SEC_WEBSOCKET_KEY],
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
        assert_eq!(len, SAMPLE_REQUEST.len());
        assert!(is_websocket_request(&req));
    }

    #[test]
    fn test_parse_request_partial() {
        let request = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\n";
        assert!(parse_request(request).unwrap().is_none());
    }

    #[test]
    fn test_is_websocket_request_rejects_plain_http() {
        let req = Request::builder()
            .uri("/index.html")
            .header("Host", "example.com")
            .body(())
            .unwrap();
        assert!(!is_websocket_request(&req));

        let (mut req, _) = parse_request(SAMPLE_REQUEST).unwrap().unwrap();
        req.headers_mut()
            .insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("short"));
        assert!(!is_websocket_request(&req));
    }

    #[test]
    fn test_server_handshake() {
        let (req, _) = parse_request(SAMPLE_REQUEST).unwrap().unwrap();
        let server = ServerHandshake::new(&req, &["superchat".to_string()]).unwrap();
        assert_eq!(server.accept_key(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(server.protocol(), Some("superchat"));

        let response = server.response();
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: superchat\r\n"));
    }

    #[test]
    fn test_server_handshake_wrong_version() {
        let raw = std::str::from_utf8(SAMPLE_REQUEST)
            .unwrap()
            .replace("Version: 13", "Version: 8");
        let (req, _) = parse_request(raw.as_bytes()).unwrap().unwrap();
        assert!(matches!(
            ServerHandshake::new(&req, &[]),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_client_request_injects_headers() {
        let client = ClientHandshake::new(
            template("ws://example.com:9001/socket?room=1"),
            &["chat".to_string()],
            Some("http://example.com"),
        )
        .unwrap();

        let bytes = client.to_bytes();
        let (req, len) = parse_request(&bytes).unwrap().unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(req.uri(), "/socket?room=1");
        assert_eq!(req.headers()[header::HOST], "example.com:9001");
        assert_eq!(req.headers()[header::ORIGIN], "http://example.com");
        assert_eq!(req.headers()[header::SEC_WEBSOCKET_PROTOCOL], "chat");
        assert_eq!(req.headers()[header::SEC_WEBSOCKET_KEY], client.key());
        assert!(is_websocket_request(&req));
    }

    #[test]
    fn test_client_request_keeps_template_headers() {
        let request = Request::builder()
            .uri("ws://example.com/")
            .header("Authorization", "Bearer token")
            .extension(HandshakeTimeout(Duration::from_secs(3)))
            .body(())
            .unwrap();
        let client = ClientHandshake::new(request, &[], None).unwrap();
        assert_eq!(client.timeout(), Some(Duration::from_secs(3)));
        assert_eq!(client.request().headers()["authorization"], "Bearer token");
        assert!(!client.request().headers().contains_key(header::ORIGIN));
    }

    #[test]
    fn test_full_round_trip() {
        let client =
            ClientHandshake::new(template("ws://example.com/"), &["b".into(), "a".into()], None)
                .unwrap();
        let (req, _) = parse_request(&client.to_bytes()).unwrap().unwrap();
        let server = ServerHandshake::new(&req, &["a".into(), "b".into()]).unwrap();
        // Client preference order wins
        assert_eq!(server.protocol(), Some("b"));

        let (response, _) = parse_response(&server.response()).unwrap().unwrap();
        assert_eq!(client.finish(&response).unwrap(), Some("b".to_string()));
    }

    #[test]
    fn test_client_rejects_bad_accept() {
        let client = ClientHandshake::new(template("ws://example.com/"), &[], None).unwrap();
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", None);
        let (response, _) = parse_response(&response).unwrap().unwrap();
        assert!(matches!(
            client.finish(&response),
            Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"))
        ));
    }

    #[test]
    fn test_client_rejects_non_101() {
        let client = ClientHandshake::new(template("ws://example.com/"), &[], None).unwrap();
        let (response, _) = parse_response(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(client.finish(&response).is_err());
    }

    #[test]
    fn test_client_rejects_unoffered_protocol() {
        let client =
            ClientHandshake::new(template("ws://example.com/"), &["chat".into()], None).unwrap();
        let accept = generate_accept_key(client.key());
        let response = build_response(&accept, Some("mqtt"));
        let (response, _) = parse_response(&response).unwrap().unwrap();
        assert!(client.finish(&response).is_err());
    }

    #[test]
    fn test_validate_accept_key() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
        assert!(validate_accept_key(key, accept));
        assert!(!validate_accept_key(key, "invalid"));
    }
}
