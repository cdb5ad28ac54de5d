//! Receive side of a playing session: keepalive plus one loop per
//! transport (the shared interleaved stream, or each UDP socket).

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{NegotiatedTrack, RtspSession, SessionState, TrackBinding, TrackCommand};
use crate::config::RtpTransport;
use crate::error::Result;
use crate::media::{Frame, parser_for};
use crate::protocol::RequestFactory;
use crate::rtcp::{RtcpPacket, RtcpReporter, ntp_to_system_time, parse_compound};
use crate::stream::{ReorderBuffer, RtpStream};
use crate::transport::udp::recv_datagram;
use crate::transport::{ControlConnection, Incoming, UdpChannelPair};

/// Capacity of each track's command queue.
const COMMAND_QUEUE: usize = 16;

impl RtspSession {
    /// Receive media until cancelled, a server BYE, or a fatal error.
    ///
    /// Returns `Ok(())` on cancellation or BYE. When `token` (the caller's)
    /// was cancelled, a best-effort TEARDOWN is sent before returning.
    pub async fn receive(&self, token: CancellationToken) -> Result<()> {
        let connection = self.connection()?.clone();
        let linked = token.child_token();
        let emitter = Emitter {
            frames: self.frames.clone(),
            seen: self.frame_seen.clone(),
        };
        let cname = connection.local_addr().ip().to_string();
        let now = Instant::now();

        let mut tasks = JoinSet::new();

        let shutdown = self.shutdown.clone();
        let watched = linked.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => watched.cancel(),
                _ = watched.cancelled() => {}
            }
            Ok(())
        });

        tasks.spawn(keepalive(
            connection.clone(),
            self.session_timeout,
            self.keepalive_get_parameter,
            self.params.transport,
            linked.clone(),
        ));

        match self.params.transport {
            RtpTransport::Tcp => {
                let tracks = self
                    .tracks
                    .iter()
                    .filter_map(|track| match track.binding {
                        TrackBinding::Interleaved {
                            rtp_channel,
                            rtcp_channel,
                        } => Some(InterleavedTrack {
                            rtp_channel,
                            rtcp_channel,
                            stream: self.stream_for(track),
                            reporter: RtcpReporter::new(&cname, now),
                        }),
                        TrackBinding::Udp { .. } => None,
                    })
                    .collect();
                tasks.spawn(receive_interleaved(
                    connection.clone(),
                    tracks,
                    emitter,
                    linked.clone(),
                ));
            }
            RtpTransport::Udp => {
                let (senders, receivers): (Vec<_>, Vec<_>) = self
                    .tracks
                    .iter()
                    .map(|_| mpsc::channel::<TrackCommand>(COMMAND_QUEUE))
                    .unzip();

                for (track, commands) in self.tracks.iter().zip(receivers) {
                    let TrackBinding::Udp { pair, .. } = &track.binding else {
                        continue;
                    };
                    let stream = self
                        .stream_for(track)
                        .with_reorder_buffer(ReorderBuffer::default());
                    tasks.spawn(receive_rtp(
                        pair.clone(),
                        stream,
                        RtcpReporter::new(&cname, now),
                        commands,
                        emitter.clone(),
                        linked.clone(),
                    ));
                    tasks.spawn(receive_rtcp(
                        pair.clone(),
                        track.index,
                        senders.clone(),
                        linked.clone(),
                    ));
                }
            }
        }
        tracing::debug!(tracks = self.tracks.len(), "receive loops started");

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            // The first loop to end takes the others down with it.
            linked.cancel();
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        tracing::warn!(error = %e, "receive loop failed");
                        result = Err(e);
                    }
                }
                Err(e) if e.is_panic() => tracing::warn!("receive task panicked"),
                Err(_) => {}
            }
        }

        if token.is_cancelled() && !self.shutdown.is_cancelled() {
            self.teardown().await;
        } else {
            self.set_state(SessionState::Closed);
        }
        result
    }

    fn stream_for(&self, track: &NegotiatedTrack) -> RtpStream {
        RtpStream::new(
            track.index,
            track.descriptor.clock_rate,
            parser_for(&track.descriptor, self.base_time),
        )
    }
}

/// Frame sink shared by all receive loops of a session.
#[derive(Clone)]
struct Emitter {
    frames: mpsc::Sender<Frame>,
    seen: Arc<AtomicBool>,
}

impl Emitter {
    /// Hand frames to the caller. Returns `false` once cancelled.
    async fn emit(&self, frames: Vec<Frame>, token: &CancellationToken) -> bool {
        for frame in frames {
            tracing::trace!(
                track = frame.track,
                kind = %frame.kind,
                len = frame.payload.len(),
                key_frame = frame.key_frame,
                "frame"
            );
            self.seen.store(true, Ordering::Release);
            tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                sent = self.frames.send(frame) => {
                    if sent.is_err() {
                        tracing::trace!("frame receiver dropped");
                    }
                }
            }
        }
        true
    }
}

/// What an inbound RTCP compound means to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RtcpSignal {
    Nothing,
    SenderReport(u64),
    Goodbye,
}

fn inspect_rtcp(data: &[u8]) -> RtcpSignal {
    let mut signal = RtcpSignal::Nothing;
    for packet in parse_compound(data) {
        match packet {
            RtcpPacket::Goodbye(_) => return RtcpSignal::Goodbye,
            RtcpPacket::SenderReport(sr) => signal = RtcpSignal::SenderReport(sr.ntp_timestamp),
            RtcpPacket::ReceiverReport(_) | RtcpPacket::Other(_) => {}
        }
    }
    signal
}

/// Uniform in `[timeout/2, timeout*3/4)`.
pub(crate) fn keepalive_interval(timeout: Duration) -> Duration {
    let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let (low, high) = (ms / 2, ms / 4 * 3);
    if high <= low {
        return Duration::from_millis(low);
    }
    Duration::from_millis(rand::rng().random_range(low..high))
}

async fn keepalive(
    connection: Arc<ControlConnection>,
    timeout: Duration,
    get_parameter: bool,
    transport: RtpTransport,
    token: CancellationToken,
) -> Result<()> {
    let build = move |f: &mut RequestFactory| {
        if get_parameter {
            f.create_get_parameter()
        } else {
            f.create_options()
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(keepalive_interval(timeout)) => {}
        }

        match transport {
            RtpTransport::Tcp => connection.send(build).await?,
            RtpTransport::Udp => {
                let response = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(()),
                    response = connection.execute(build) => response?,
                };
                if !response.is_success() {
                    tracing::warn!(status = response.status_code, "keepalive rejected");
                }
            }
        }
        tracing::trace!(get_parameter, "keepalive sent");
    }
}

struct InterleavedTrack {
    rtp_channel: u8,
    rtcp_channel: u8,
    stream: RtpStream,
    reporter: RtcpReporter,
}

async fn receive_interleaved(
    connection: Arc<ControlConnection>,
    mut tracks: Vec<InterleavedTrack>,
    emitter: Emitter,
    token: CancellationToken,
) -> Result<()> {
    let result = interleaved_loop(&connection, &mut tracks, &emitter, &token).await;

    let now = Instant::now();
    for track in &mut tracks {
        let ssrc = track.stream.remote_ssrc();
        if let Some(bye) = track.reporter.goodbye(track.stream.tracker(), ssrc, now)
            && let Err(e) = connection.write_interleaved(track.rtcp_channel, &bye).await
        {
            tracing::debug!(channel = track.rtcp_channel, error = %e, "RTCP BYE not sent");
        }
    }
    result
}

async fn interleaved_loop(
    connection: &ControlConnection,
    tracks: &mut [InterleavedTrack],
    emitter: &Emitter,
    token: &CancellationToken,
) -> Result<()> {
    loop {
        let incoming = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            incoming = connection.read_incoming() => incoming?,
        };
        let now = Instant::now();

        match incoming {
            Incoming::Response(response) => {
                tracing::debug!(
                    status = response.status_code,
                    cseq = response.cseq(),
                    "response on interleaved stream"
                );
            }
            Incoming::Interleaved { channel, payload } => {
                if let Some(track) = tracks.iter_mut().find(|t| t.rtp_channel == channel) {
                    let frames = track.stream.process(payload, now);
                    if !emitter.emit(frames, token).await {
                        return Ok(());
                    }
                } else if let Some(i) = tracks.iter().position(|t| t.rtcp_channel == channel) {
                    match inspect_rtcp(&payload) {
                        RtcpSignal::Goodbye => {
                            tracing::info!(channel, "server sent RTCP BYE");
                            token.cancel();
                            return Ok(());
                        }
                        RtcpSignal::SenderReport(ntp) => {
                            tracks[i].reporter.record_sender_report(ntp, now);
                            if let Some(base) = ntp_to_system_time(ntp) {
                                tracing::debug!(channel, "rebasing on sender report");
                                for track in tracks.iter_mut() {
                                    track.stream.rebase(base);
                                }
                            }
                        }
                        RtcpSignal::Nothing => {}
                    }
                } else {
                    tracing::trace!(channel, "data on unknown channel");
                }
            }
        }

        for track in tracks.iter_mut() {
            if track.reporter.is_due(now) {
                let ssrc = track.stream.remote_ssrc();
                let report = track.reporter.report(track.stream.tracker_mut(), ssrc, now);
                connection.write_interleaved(track.rtcp_channel, &report).await?;
            }
        }
    }
}

async fn receive_rtp(
    pair: UdpChannelPair,
    mut stream: RtpStream,
    mut reporter: RtcpReporter,
    mut commands: mpsc::Receiver<TrackCommand>,
    emitter: Emitter,
    token: CancellationToken,
) -> Result<()> {
    let result = rtp_loop(&pair, &mut stream, &mut reporter, &mut commands, &emitter, &token).await;

    let ssrc = stream.remote_ssrc();
    if let Some(bye) = reporter.goodbye(stream.tracker(), ssrc, Instant::now())
        && let Err(e) = pair.rtcp.send(&bye).await
    {
        tracing::debug!(track = stream.track(), error = %e, "RTCP BYE not sent");
    }
    result
}

async fn rtp_loop(
    pair: &UdpChannelPair,
    stream: &mut RtpStream,
    reporter: &mut RtcpReporter,
    commands: &mut mpsc::Receiver<TrackCommand>,
    emitter: &Emitter,
    token: &CancellationToken,
) -> Result<()> {
    let mut buf = BytesMut::new();
    loop {
        let flush_at = stream.deadline();
        let report_at = reporter.next_report();

        let frames = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            Some(command) = commands.recv() => {
                match command {
                    TrackCommand::Rebase(base) => stream.rebase(base),
                    TrackCommand::SenderReport { ntp, received_at } => {
                        reporter.record_sender_report(ntp, received_at);
                    }
                }
                continue;
            }
            datagram = recv_datagram(&pair.rtp, &mut buf) => stream.process(datagram?, Instant::now()),
            _ = sleep_until(flush_at) => stream.flush_expired(Instant::now()),
            _ = tokio::time::sleep_until(report_at.into()) => {
                let ssrc = stream.remote_ssrc();
                let report = reporter.report(stream.tracker_mut(), ssrc, Instant::now());
                match pair.rtcp.send(&report).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        tracing::trace!(track = stream.track(), "RTCP report refused");
                    }
                    Err(e) => return Err(e.into()),
                }
                continue;
            }
        };

        if !emitter.emit(frames, token).await {
            return Ok(());
        }
    }
}

async fn receive_rtcp(
    pair: UdpChannelPair,
    index: usize,
    commands: Vec<mpsc::Sender<TrackCommand>>,
    token: CancellationToken,
) -> Result<()> {
    let mut buf = BytesMut::new();
    loop {
        let datagram = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            datagram = recv_datagram(&pair.rtcp, &mut buf) => datagram?,
        };
        let received_at = Instant::now();

        match inspect_rtcp(&datagram) {
            RtcpSignal::Goodbye => {
                tracing::info!(track = index, "server sent RTCP BYE");
                token.cancel();
                return Ok(());
            }
            RtcpSignal::SenderReport(ntp) => {
                if let Some(own) = commands.get(index) {
                    deliver(own, TrackCommand::SenderReport { ntp, received_at });
                }
                if let Some(base) = ntp_to_system_time(ntp) {
                    tracing::debug!(track = index, "rebasing on sender report");
                    for queue in &commands {
                        deliver(queue, TrackCommand::Rebase(base));
                    }
                }
            }
            RtcpSignal::Nothing => {}
        }
    }
}

fn deliver(queue: &mpsc::Sender<TrackCommand>, command: TrackCommand) {
    if let Err(e) = queue.try_send(command) {
        tracing::debug!(error = %e, "track command dropped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::media::MediaKind;
    use crate::rtcp::{ReceiverReport, write_bye};

    #[test]
    fn keepalive_interval_bounds() {
        let timeout = Duration::from_secs(60);
        for _ in 0..200 {
            let wait = keepalive_interval(timeout);
            assert!(wait >= Duration::from_secs(30));
            assert!(wait < Duration::from_secs(45));
        }
        assert_eq!(keepalive_interval(Duration::ZERO), Duration::ZERO);
    }

    fn sender_report(ntp: u64) -> Vec<u8> {
        let mut sr = vec![0x80, 200, 0x00, 0x06];
        sr.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        sr.extend_from_slice(&ntp.to_be_bytes());
        sr.extend_from_slice(&[0u8; 12]);
        sr
    }

    #[test]
    fn rtcp_signals() {
        let mut rr = BytesMut::new();
        ReceiverReport {
            ssrc: 1,
            blocks: Vec::new(),
        }
        .write(&mut rr);
        assert_eq!(inspect_rtcp(&rr), RtcpSignal::Nothing);

        let ntp = 0xE000_0000_8000_0000;
        assert_eq!(inspect_rtcp(&sender_report(ntp)), RtcpSignal::SenderReport(ntp));

        let mut compound = BytesMut::from(&sender_report(ntp)[..]);
        write_bye(&mut compound, 7);
        assert_eq!(inspect_rtcp(&compound), RtcpSignal::Goodbye);

        assert_eq!(inspect_rtcp(&[0x00, 0x01]), RtcpSignal::Nothing);
    }

    #[tokio::test]
    async fn emitter_flags_activity_and_stops_on_cancel() {
        let (tx, mut rx) = mpsc::channel(1);
        let seen = Arc::new(AtomicBool::new(false));
        let emitter = Emitter {
            frames: tx,
            seen: seen.clone(),
        };
        let token = CancellationToken::new();
        let frame = || Frame::new(MediaKind::Audio, SystemTime::now(), Bytes::from_static(b"a"));

        assert!(emitter.emit(vec![frame()], &token).await);
        assert!(seen.load(Ordering::Acquire));
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"a"));

        // Channel full: the second send can only end through cancellation.
        token.cancel();
        assert!(!emitter.emit(vec![frame(), frame()], &token).await);
    }
}
