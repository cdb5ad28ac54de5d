use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use url::Url;

use crate::config::RequestParams;

use super::auth::Authenticator;

/// RTSP methods issued by the client (RFC 2326 §10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
        })
    }
}

/// An outgoing RTSP request (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
///
/// Built with [`add_header`](Self::add_header), rendered with
/// [`serialize`](Self::serialize). Requests never carry a body.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The CSeq this request was numbered with (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<u32> {
        self.get_header("CSeq")?.trim().parse().ok()
    }

    pub fn serialize(&self) -> String {
        let mut request = format!("{} {} RTSP/1.0\r\n", self.method, self.uri);
        for (name, value) in &self.headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        request.push_str("\r\n");
        request
    }
}

/// Numbers and decorates every request of one session.
///
/// Owns the monotonically increasing CSeq, the `Session` id once SETUP
/// assigned one, the content base from DESCRIBE and the authenticator
/// negotiated after a `401`.
#[derive(Debug)]
pub struct RequestFactory {
    base_uri: String,
    content_base: Option<String>,
    cseq: u32,
    session_id: Option<String>,
    user_agent: String,
    authenticator: Option<Authenticator>,
}

impl RequestFactory {
    pub fn new(base_uri: &str, user_agent: &str) -> Self {
        Self {
            base_uri: base_uri.to_string(),
            content_base: None,
            cseq: 0,
            session_id: None,
            user_agent: user_agent.to_string(),
            authenticator: None,
        }
    }

    /// URI that aggregate requests (PLAY, PAUSE, TEARDOWN, keepalive) target.
    pub fn content_base(&self) -> &str {
        self.content_base.as_deref().unwrap_or(&self.base_uri)
    }

    pub fn set_content_base(&mut self, uri: &str) {
        self.content_base = Some(uri.to_string());
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, id: &str) {
        self.session_id = Some(id.to_string());
    }

    pub fn set_authenticator(&mut self, authenticator: Authenticator) {
        self.authenticator = Some(authenticator);
    }

    pub fn has_authenticator(&self) -> bool {
        self.authenticator.is_some()
    }

    pub fn create_options(&mut self) -> RtspRequest {
        let uri = self.base_uri.clone();
        self.create(Method::Options, &uri)
    }

    pub fn create_describe(&mut self) -> RtspRequest {
        let uri = self.base_uri.clone();
        self.create(Method::Describe, &uri)
            .add_header("Accept", "application/sdp")
    }

    /// SETUP with `RTP/AVP/TCP;unicast;interleaved=rtp-rtcp`.
    pub fn create_setup_interleaved(
        &mut self,
        control: &str,
        rtp_channel: u8,
        rtcp_channel: u8,
    ) -> RtspRequest {
        let uri = self.track_uri(control);
        self.create(Method::Setup, &uri).add_header(
            "Transport",
            &format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
        )
    }

    /// SETUP with `RTP/AVP;unicast;client_port=rtp-rtcp`.
    pub fn create_setup_udp(&mut self, control: &str, rtp_port: u16, rtcp_port: u16) -> RtspRequest {
        let uri = self.track_uri(control);
        self.create(Method::Setup, &uri).add_header(
            "Transport",
            &format!("RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port}"),
        )
    }

    /// PLAY with `Range: clock=...-` when an initial timestamp is requested,
    /// otherwise `Range: npt=0.000-` (RFC 2326 §12.29, §3.7).
    pub fn create_play(&mut self, params: &RequestParams) -> RtspRequest {
        let uri = self.content_base().to_string();
        let range = match params.initial_timestamp {
            Some(ts) => format!("clock={}-", format_clock(ts)),
            None => "npt=0.000-".to_string(),
        };
        let request = self.create(Method::Play, &uri).add_header("Range", &range);
        with_extra_headers(request, params)
    }

    pub fn create_pause(&mut self, params: &RequestParams) -> RtspRequest {
        let uri = self.content_base().to_string();
        let request = self.create(Method::Pause, &uri);
        with_extra_headers(request, params)
    }

    pub fn create_teardown(&mut self) -> RtspRequest {
        let uri = self.content_base().to_string();
        self.create(Method::Teardown, &uri)
    }

    pub fn create_get_parameter(&mut self) -> RtspRequest {
        let uri = self.content_base().to_string();
        self.create(Method::GetParameter, &uri)
    }

    /// Resolve an SDP `a=control` value against the content base.
    ///
    /// Absolute controls are used as-is, `*` means the aggregate URI and
    /// anything else is appended to the base path. A query on the base is
    /// kept unless the control carries its own.
    pub fn track_uri(&self, control: &str) -> String {
        let base = self.content_base();
        if control.is_empty() || control == "*" {
            return base.to_string();
        }
        if control.contains("://") {
            return control.to_string();
        }

        let (path, query) = match control.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (control, None),
        };
        let Ok(mut uri) = Url::parse(base) else {
            return format!("{}/{}", base.trim_end_matches('/'), control.trim_start_matches('/'));
        };
        let joined = format!(
            "{}/{}",
            uri.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        uri.set_path(&joined);
        if query.is_some() {
            uri.set_query(query);
        }
        uri.to_string()
    }

    fn create(&mut self, method: Method, uri: &str) -> RtspRequest {
        self.cseq += 1;

        let mut request = RtspRequest::new(method, uri)
            .add_header("CSeq", &self.cseq.to_string())
            .add_header("User-Agent", &self.user_agent);

        if let Some(auth) = self.authenticator.as_mut() {
            let value = auth.authorization(&method.to_string(), uri);
            request = request.add_header("Authorization", &value);
        }
        if let Some(session) = &self.session_id {
            request = request.add_header("Session", session);
        }
        request
    }
}

fn with_extra_headers(mut request: RtspRequest, params: &RequestParams) -> RtspRequest {
    for (name, value) in &params.headers {
        request = request.add_header(name, value);
    }
    request
}

/// `YYYYMMDDTHHMMSSZ`, the absolute time format of RFC 2326 §3.7.
fn format_clock(ts: SystemTime) -> String {
    DateTime::<Utc>::from(ts).format("%Y%m%dT%H%M%SZ").to_string()
}
