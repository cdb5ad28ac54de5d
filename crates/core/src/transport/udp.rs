use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;

use crate::error::Result;

/// Largest datagram read from a media socket.
const MAX_DATAGRAM: usize = 65_536;

/// The RTP/RTCP socket pair of one UDP track.
///
/// RTCP is bound to the port right after RTP when it is free
/// (RFC 3550 §11), otherwise to any port the OS hands out. After SETUP
/// both sockets are connected to the server ports, so only the server's
/// datagrams are received.
#[derive(Debug, Clone)]
pub struct UdpChannelPair {
    pub rtp: Arc<UdpSocket>,
    pub rtcp: Arc<UdpSocket>,
}

impl UdpChannelPair {
    /// Bind a fresh pair on the wildcard address of `peer`'s family.
    pub async fn bind(peer: IpAddr) -> Result<Self> {
        let any = match peer {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let rtp = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
        let rtp_port = rtp.local_addr()?.port();

        let rtcp = match rtp_port.checked_add(1) {
            Some(next) => match UdpSocket::bind(SocketAddr::new(any, next)).await {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::debug!(port = next, error = %e, "RTCP port taken, using any port");
                    UdpSocket::bind(SocketAddr::new(any, 0)).await?
                }
            },
            None => UdpSocket::bind(SocketAddr::new(any, 0)).await?,
        };

        let pair = Self {
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
        };
        tracing::debug!(
            rtp_port = pair.rtp_port(),
            rtcp_port = pair.rtcp_port(),
            "UDP channel pair bound"
        );
        Ok(pair)
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp.local_addr().map(|a| a.port()).unwrap_or_default()
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtcp.local_addr().map(|a| a.port()).unwrap_or_default()
    }

    /// Connect both sockets to the server and punch a hole with an empty
    /// datagram on each.
    pub async fn connect(&self, source: IpAddr, rtp_port: u16, rtcp_port: u16) -> Result<()> {
        self.rtp.connect(SocketAddr::new(source, rtp_port)).await?;
        self.rtcp.connect(SocketAddr::new(source, rtcp_port)).await?;

        for socket in [&self.rtp, &self.rtcp] {
            if let Err(e) = socket.send(&[]).await {
                tracing::debug!(error = %e, "hole punch datagram failed");
            }
        }
        tracing::debug!(%source, rtp_port, rtcp_port, "UDP channel pair connected");
        Ok(())
    }
}

/// Receive one datagram, skipping ICMP port-unreachable reports that a
/// connected socket surfaces as `ConnectionRefused`.
///
/// `buf` is the receiving loop's scratch space; the datagram is split off
/// it, so its allocation is reused once earlier datagrams are dropped.
pub async fn recv_datagram(socket: &UdpSocket, buf: &mut BytesMut) -> Result<Bytes> {
    loop {
        buf.clear();
        buf.reserve(MAX_DATAGRAM);
        match socket.recv_buf(buf).await {
            Ok(len) => return Ok(buf.split_to(len).freeze()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::trace!("ignoring ICMP port unreachable");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
