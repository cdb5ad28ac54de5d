//! RTSP session, client side (RFC 2326 §3, §A.1).
//!
//! One [`RtspSession`] drives a single presentation from OPTIONS to
//! TEARDOWN over one control connection.
//!
//! ## Session lifecycle
//!
//! ```text
//! Idle -> Connecting -> Describing -> SettingUpTracks -> Playing <-> Paused
//!                                                           |
//!                                                      TearingDown -> Closed
//! ```
//!
//! Any fatal error, cancellation or [`dispose`](RtspSession::dispose) ends
//! in `Closed`.

mod receive;
pub mod track;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionParameters, RequestParams, RtpTransport};
use crate::error::{ProtocolErrorKind, Result, RtspError};
use crate::media::Frame;
use crate::protocol::headers::{
    DEFAULT_SESSION_TIMEOUT, SessionHeader, TransportHeader, supports_get_parameter,
};
use crate::protocol::sdp::parse_sdp;
use crate::protocol::{RtspResponse, TrackDescriptor};
use crate::transport::{ControlConnection, UdpChannelPair};

pub use track::{NegotiatedTrack, SessionDescription, TrackBinding, TrackCommand};

/// Client session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Describing,
    SettingUpTracks,
    Playing,
    Paused,
    TearingDown,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Describing => "describing",
            Self::SettingUpTracks => "setting up tracks",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::TearingDown => "tearing down",
            Self::Closed => "closed",
        })
    }
}

/// A single RTSP session.
///
/// [`connect`](Self::connect) takes `&mut self`; afterwards the session is
/// shared (`Arc`) so that [`receive`](Self::receive) can run while
/// [`play`](Self::play) and [`pause`](Self::pause) are issued.
pub struct RtspSession {
    params: ConnectionParameters,
    state: Mutex<SessionState>,
    connection: Option<Arc<ControlConnection>>,
    description: Option<SessionDescription>,
    tracks: Vec<NegotiatedTrack>,
    session_timeout: Duration,
    keepalive_get_parameter: bool,
    base_time: SystemTime,
    frames: mpsc::Sender<Frame>,
    frame_seen: Arc<AtomicBool>,
    paused: AtomicBool,
    shutdown: CancellationToken,
}

impl RtspSession {
    /// A session in [`SessionState::Idle`] that will emit frames on `frames`.
    pub fn new(params: ConnectionParameters, frames: mpsc::Sender<Frame>) -> Self {
        Self {
            params,
            state: Mutex::new(SessionState::Idle),
            connection: None,
            description: None,
            tracks: Vec::new(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            keepalive_get_parameter: false,
            base_time: SystemTime::now(),
            frames,
            frame_seen: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(old_state = %*current, new_state = %state, "session state");
            *current = state;
        }
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        self.description.as_ref()
    }

    pub fn tracks(&self) -> &[NegotiatedTrack] {
        &self.tracks
    }

    /// Session timeout from the server's `Session` header.
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether a frame was emitted since the last call.
    pub fn take_frame_activity(&self) -> bool {
        self.frame_seen.swap(false, Ordering::AcqRel)
    }

    fn connection(&self) -> Result<&Arc<ControlConnection>> {
        self.connection.as_ref().ok_or(RtspError::NotConnected)
    }

    /// OPTIONS, DESCRIBE, one SETUP per wanted track, then PLAY.
    pub async fn connect(&mut self, request: &RequestParams) -> Result<()> {
        let result = self.handshake(request).await;
        if result.is_err() {
            self.set_state(SessionState::Closed);
        }
        result
    }

    async fn handshake(&mut self, request: &RequestParams) -> Result<()> {
        self.set_state(SessionState::Connecting);
        let connection = Arc::new(ControlConnection::connect(&self.params).await?);
        self.connection = Some(connection.clone());

        let options = connection.execute(|f| f.create_options()).await?;
        self.keepalive_get_parameter =
            options.is_success() && supports_get_parameter(options.get_header("Public"));

        self.set_state(SessionState::Describing);
        let describe = connection.ensure_execute(|f| f.create_describe()).await?;
        if let Some(base) = describe
            .get_header("Content-Base")
            .or_else(|| describe.get_header("Content-Location"))
        {
            connection.with_factory(|f| f.set_content_base(base));
        }

        let sdp = describe.body_text();
        let all = parse_sdp(&sdp);
        let wanted: Vec<TrackDescriptor> = all
            .iter()
            .filter(|t| self.params.required_tracks.contains(t.kind))
            .cloned()
            .collect();
        if wanted.is_empty() {
            tracing::warn!(offered = all.len(), "no track matches the required kinds");
            return Err(RtspError::NoTrack);
        }

        self.set_state(SessionState::SettingUpTracks);
        for (n, descriptor) in wanted.into_iter().enumerate() {
            self.setup_track(&connection, n, descriptor).await?;
        }

        self.description = Some(SessionDescription {
            sdp,
            tracks: self.tracks.iter().map(|t| t.descriptor.clone()).collect(),
        });

        connection
            .ensure_execute(|f| f.create_play(request))
            .await?;
        self.base_time = request.initial_timestamp.unwrap_or_else(SystemTime::now);
        self.set_state(SessionState::Playing);

        tracing::info!(
            uri = %self.params.request_uri(),
            tracks = self.tracks.len(),
            transport = ?self.params.transport,
            "session playing"
        );
        Ok(())
    }

    async fn setup_track(
        &mut self,
        connection: &ControlConnection,
        n: usize,
        descriptor: TrackDescriptor,
    ) -> Result<()> {
        let control = descriptor.control.clone();

        let (transport, binding) = match self.params.transport {
            RtpTransport::Tcp => {
                let rtp_channel = u8::try_from(n * 2)
                    .map_err(|_| RtspError::protocol(ProtocolErrorKind::InvalidTransport))?;
                let rtcp_channel = rtp_channel
                    .checked_add(1)
                    .ok_or(RtspError::protocol(ProtocolErrorKind::InvalidTransport))?;

                let response = connection
                    .ensure_execute(|f| f.create_setup_interleaved(&control, rtp_channel, rtcp_channel))
                    .await?;
                self.apply_session_header(connection, &response);

                let transport =
                    TransportHeader::parse_interleaved(transport_header(&response)?)
                        .ok_or(RtspError::protocol(ProtocolErrorKind::InvalidTransport))?;
                let (Ok(rtp_channel), Ok(rtcp_channel)) =
                    (u8::try_from(transport.rtp), u8::try_from(transport.rtcp))
                else {
                    return Err(RtspError::protocol(ProtocolErrorKind::InvalidTransport));
                };
                (
                    transport,
                    TrackBinding::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                    },
                )
            }
            RtpTransport::Udp => {
                let peer = connection.peer_addr().ip();
                let pair = UdpChannelPair::bind(peer).await?;
                let (rtp_port, rtcp_port) = (pair.rtp_port(), pair.rtcp_port());

                let response = connection
                    .ensure_execute(|f| f.create_setup_udp(&control, rtp_port, rtcp_port))
                    .await?;
                self.apply_session_header(connection, &response);

                let transport =
                    TransportHeader::parse_server_ports(transport_header(&response)?)
                        .ok_or(RtspError::protocol(ProtocolErrorKind::InvalidTransport))?;
                let binding = TrackBinding::Udp {
                    pair,
                    server_rtp_port: transport.rtp,
                    server_rtcp_port: transport.rtcp,
                };
                (transport, binding)
            }
        };

        if self.tracks.iter().any(|t| t.claims(transport.rtp, transport.rtcp)) {
            tracing::warn!(
                control = %control,
                rtp = transport.rtp,
                rtcp = transport.rtcp,
                "server reused a channel/port, dropping track"
            );
            return Ok(());
        }

        if let TrackBinding::Udp { pair, .. } = &binding {
            let source = transport.source.unwrap_or(connection.peer_addr().ip());
            pair.connect(source, transport.rtp, transport.rtcp).await?;
        }

        let index = self.tracks.len();
        tracing::debug!(
            track = index,
            kind = %descriptor.kind,
            codec = descriptor.codec.name(),
            rtp = transport.rtp,
            rtcp = transport.rtcp,
            "track set up"
        );
        self.tracks.push(NegotiatedTrack {
            index,
            descriptor,
            binding,
        });
        Ok(())
    }

    fn apply_session_header(&mut self, connection: &ControlConnection, response: &RtspResponse) {
        let Some(session) = response.get_header("Session").and_then(SessionHeader::parse) else {
            return;
        };
        connection.with_factory(|f| f.set_session_id(&session.id));
        self.session_timeout = session.timeout;
    }

    /// Resume (or reposition) playback.
    ///
    /// Over TCP the request is pipelined: the receive loop owns the read
    /// side and consumes the reply. Over UDP it is a full round trip.
    pub async fn play(&self, request: &RequestParams) -> Result<()> {
        let connection = self.connection()?;
        match self.params.transport {
            RtpTransport::Tcp => connection.send(|f| f.create_play(request)).await?,
            RtpTransport::Udp => {
                connection.ensure_execute(|f| f.create_play(request)).await?;
            }
        }
        self.paused.store(false, Ordering::Release);
        self.set_state(SessionState::Playing);
        Ok(())
    }

    /// Suspend playback. Receive timeouts are not reported while paused.
    pub async fn pause(&self, request: &RequestParams) -> Result<()> {
        let connection = self.connection()?;
        match self.params.transport {
            RtpTransport::Tcp => connection.send(|f| f.create_pause(request)).await?,
            RtpTransport::Udp => {
                connection.ensure_execute(|f| f.create_pause(request)).await?;
            }
        }
        self.paused.store(true, Ordering::Release);
        self.set_state(SessionState::Paused);
        Ok(())
    }

    /// Best-effort TEARDOWN. Failures are logged and swallowed.
    pub(crate) async fn teardown(&self) {
        let Ok(connection) = self.connection() else {
            return;
        };
        self.set_state(SessionState::TearingDown);

        let result = match self.params.transport {
            RtpTransport::Tcp => connection.send(|f| f.create_teardown()).await,
            RtpTransport::Udp => connection.execute(|f| f.create_teardown()).await.map(drop),
        };
        match result {
            Ok(()) => tracing::info!("session torn down"),
            Err(e) => tracing::debug!(error = %e, "TEARDOWN failed"),
        }
        self.set_state(SessionState::Closed);
    }

    /// Stop every receive loop without TEARDOWN. Sockets close once the
    /// session and its receive future are dropped.
    pub fn dispose(&self) {
        self.shutdown.cancel();
        self.set_state(SessionState::Closed);
    }
}

fn transport_header(response: &RtspResponse) -> Result<&str> {
    response
        .get_header("Transport")
        .ok_or(RtspError::protocol(ProtocolErrorKind::MissingHeader("Transport")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RtspSession {
        let params = ConnectionParameters::new("rtsp://127.0.0.1:1/live").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        RtspSession::new(params, tx)
    }

    #[test]
    fn starts_idle_and_disposes_to_closed() {
        let s = session();
        assert_eq!(s.state(), SessionState::Idle);
        s.dispose();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn requests_before_connect_fail() {
        let s = session();
        assert!(matches!(
            s.play(&RequestParams::default()).await,
            Err(RtspError::NotConnected)
        ));
        assert!(matches!(
            s.receive(CancellationToken::new()).await,
            Err(RtspError::NotConnected)
        ));
    }

    #[test]
    fn frame_activity_is_consumed() {
        let s = session();
        assert!(!s.take_frame_activity());
        s.frame_seen.store(true, Ordering::Release);
        assert!(s.take_frame_activity());
        assert!(!s.take_frame_activity());
    }
}
