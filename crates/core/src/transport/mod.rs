//! Network transport for RTSP signaling and RTP/RTCP media.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): the control connection. With interleaved delivery
//!   (RFC 2326 §10.12) it also carries RTP/RTCP, each block framed as
//!   `$ channel length(16) payload`.
//!
//! - **HTTP tunnel** ([`http`]): the control connection for `http://` URIs,
//!   split over a GET (server to client) and a POST (client to server,
//!   base64) connection.
//!
//! - **UDP** ([`udp`]): one RTP/RTCP socket pair per track.

pub mod http;
pub mod tcp;
pub mod udp;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::{FramingErrorKind, Result, RtspError};

pub use tcp::{ControlConnection, Incoming};
pub use udp::UdpChannelPair;

/// Byte source of the control connection, plain TCP or tunnel GET.
pub(crate) type ControlReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Read a message head (status line and headers) up to the blank line.
pub(crate) async fn read_head(reader: &mut ControlReader) -> Result<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => return Err(RtspError::framing(FramingErrorKind::EndOfStream)),
            Ok(_) => {
                let blank = line == "\r\n" || line == "\n";
                if blank && head.is_empty() {
                    // Stray CRLF between messages.
                    continue;
                }
                head.push_str(&line);
                if blank {
                    return Ok(head);
                }
            }
            Err(e) => return Err(RtspError::Transport(e)),
        }
    }
}
