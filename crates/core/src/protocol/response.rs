use crate::error::{ProtocolErrorKind, Result, RtspError};

/// A parsed RTSP response (RFC 2326 §7).
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 2\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// The head is parsed with [`parse_head`](Self::parse_head); the transport
/// then reads [`content_length`](Self::content_length) bytes and attaches
/// them with [`with_body`](Self::with_body). `HTTP/1.x` status lines are
/// accepted too, for the tunnel's GET reply.
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub version: String,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    /// Parse the status line and headers, up to the blank line.
    pub fn parse_head(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let status_line = lines
            .next()
            .ok_or(RtspError::protocol(ProtocolErrorKind::InvalidStatusLine))?;

        let mut parts = status_line.trim().splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("RTSP/") && !version.starts_with("HTTP/") {
            return Err(RtspError::protocol(ProtocolErrorKind::InvalidStatusLine));
        }
        let status_code: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(RtspError::protocol(ProtocolErrorKind::InvalidStatusLine))?;
        let status_text = parts.next().unwrap_or_default().trim().to_string();

        let mut headers = Vec::new();

        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line
                .find(':')
                .ok_or(RtspError::protocol(ProtocolErrorKind::InvalidHeader))?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            headers.push((name, value));
        }

        Ok(RtspResponse {
            version: version.to_string(),
            status_code,
            status_text,
            headers,
            body: Vec::new(),
        })
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values of a repeatable header such as `WWW-Authenticate`.
    pub fn get_headers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The echoed CSeq (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<u32> {
        self.get_header("CSeq")?.trim().parse().ok()
    }

    /// Length of the body that follows the head (RFC 2326 §12.14).
    pub fn content_length(&self) -> Result<usize> {
        match self.get_header("Content-Length") {
            Some(len) => len
                .trim()
                .parse()
                .map_err(|_| RtspError::protocol(ProtocolErrorKind::InvalidContentLength)),
            None => Ok(0),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status_code == 401
    }

    /// Map anything other than `200 OK` to [`ProtocolErrorKind::BadStatus`].
    pub fn ensure_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RtspError::protocol(ProtocolErrorKind::BadStatus {
                code: self.status_code,
                reason: self.status_text,
            }))
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
