use std::io;
use std::net::SocketAddr;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;

use super::{ControlReader, http, read_head};
use crate::config::ConnectionParameters;
use crate::error::{FramingErrorKind, ProtocolErrorKind, Result, RtspError};
use crate::protocol::auth::{Authenticator, Credentials};
use crate::protocol::{RequestFactory, RtspRequest, RtspResponse};

/// Largest response body accepted on the control connection.
const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// One unit read from the control connection.
#[derive(Debug)]
pub enum Incoming {
    Response(RtspResponse),
    /// `$ channel length payload` block (RFC 2326 §10.12).
    Interleaved { channel: u8, payload: Bytes },
}

/// Client-to-server half. Tunnelled writes are base64 encoded.
struct ControlWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    base64: bool,
}

impl ControlWriter {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.base64 {
            let encoded = BASE64_STANDARD.encode(data);
            self.inner.write_all(encoded.as_bytes()).await?;
        } else {
            self.inner.write_all(data).await?;
        }
        self.inner.flush().await
    }
}

/// The RTSP control connection.
///
/// Owns the request factory (CSeq, session id, authenticator), so every
/// request of a session goes through here. Reads and writes are guarded
/// separately: the receive loop can hold the reader while keepalive and
/// PLAY/PAUSE requests are written.
pub struct ControlConnection {
    reader: tokio::sync::Mutex<ControlReader>,
    writer: tokio::sync::Mutex<ControlWriter>,
    factory: Mutex<RequestFactory>,
    credentials: Option<Credentials>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    // Keeps the GET connection of a tunnel open.
    _tunnel_get: Option<OwnedWriteHalf>,
}

impl ControlConnection {
    /// Open the control connection, tunnelled over HTTP for `http://` URIs.
    pub async fn connect(params: &ConnectionParameters) -> Result<Self> {
        let factory = RequestFactory::new(&params.request_uri(), &params.user_agent);

        let connection = if params.is_http_tunnel() {
            let tunnel = http::open(params).await?;
            Self {
                reader: tokio::sync::Mutex::new(tunnel.reader),
                writer: tokio::sync::Mutex::new(ControlWriter {
                    inner: Box::new(tunnel.post),
                    base64: true,
                }),
                factory: Mutex::new(factory),
                credentials: params.credentials.clone(),
                peer_addr: tunnel.peer_addr,
                local_addr: tunnel.local_addr,
                _tunnel_get: Some(tunnel.get),
            }
        } else {
            let stream = TcpStream::connect((params.host(), params.port()))
                .await
                .map_err(RtspError::Connection)?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "failed to set TCP_NODELAY");
            }
            let peer_addr = stream.peer_addr().map_err(RtspError::Connection)?;
            let local_addr = stream.local_addr().map_err(RtspError::Connection)?;
            let (read, write) = stream.into_split();

            Self {
                reader: tokio::sync::Mutex::new(BufReader::new(
                    Box::new(read) as Box<dyn AsyncRead + Send + Unpin>
                )),
                writer: tokio::sync::Mutex::new(ControlWriter {
                    inner: Box::new(write),
                    base64: false,
                }),
                factory: Mutex::new(factory),
                credentials: params.credentials.clone(),
                peer_addr,
                local_addr,
                _tunnel_get: None,
            }
        };

        tracing::debug!(
            peer = %connection.peer_addr,
            local = %connection.local_addr,
            tunnel = params.is_http_tunnel(),
            "control connection established"
        );
        Ok(connection)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run `f` against the request factory, e.g. to record the session id.
    pub fn with_factory<T>(&self, f: impl FnOnce(&mut RequestFactory) -> T) -> T {
        let mut factory = self.factory.lock();
        f(&mut *factory)
    }

    /// Send a request and wait for the response carrying the same CSeq.
    ///
    /// Interleaved data and responses to earlier pipelined requests are
    /// skipped. A `401` is answered once with credentials; a second one,
    /// or one without credentials to offer, is [`RtspError::Authentication`].
    pub async fn execute(
        &self,
        mut build: impl FnMut(&mut RequestFactory) -> RtspRequest,
    ) -> Result<RtspResponse> {
        let mut reader = self.reader.lock().await;
        let mut retried = false;

        loop {
            let request = {
                let mut factory = self.factory.lock();
                build(&mut *factory)
            };
            let cseq = request.cseq();
            tracing::debug!(method = %request.method, uri = %request.uri, cseq, "request");
            self.write(request.serialize().as_bytes()).await?;

            let response = loop {
                match read_message(&mut reader).await? {
                    Incoming::Response(response)
                        if response.cseq().is_none() || response.cseq() == cseq =>
                    {
                        break response;
                    }
                    Incoming::Response(response) => {
                        tracing::debug!(cseq = response.cseq(), "skipping stale response");
                    }
                    Incoming::Interleaved { channel, payload } => {
                        tracing::trace!(channel, len = payload.len(), "skipping interleaved data");
                    }
                }
            };
            tracing::debug!(
                status = response.status_code,
                cseq,
                method = %request.method,
                "response"
            );

            if !response.is_unauthorized() {
                return Ok(response);
            }
            if retried {
                return Err(RtspError::Authentication);
            }
            let Some(credentials) = &self.credentials else {
                return Err(RtspError::Authentication);
            };
            let mut challenges = response.get_headers("WWW-Authenticate").peekable();
            if challenges.peek().is_none() {
                return Err(RtspError::Authentication);
            }
            let authenticator = Authenticator::from_challenges(credentials, challenges)?;
            self.factory.lock().set_authenticator(authenticator);
            retried = true;
        }
    }

    /// [`execute`](Self::execute), failing on any non-2xx status.
    pub async fn ensure_execute(
        &self,
        build: impl FnMut(&mut RequestFactory) -> RtspRequest,
    ) -> Result<RtspResponse> {
        self.execute(build).await?.ensure_success()
    }

    /// Write a request without waiting for its response. The response
    /// surfaces later through [`read_incoming`](Self::read_incoming).
    pub async fn send(&self, build: impl FnOnce(&mut RequestFactory) -> RtspRequest) -> Result<()> {
        let request = {
            let mut factory = self.factory.lock();
            build(&mut *factory)
        };
        tracing::debug!(
            method = %request.method,
            uri = %request.uri,
            cseq = request.cseq(),
            "request (pipelined)"
        );
        self.write(request.serialize().as_bytes()).await
    }

    /// Read the next response or interleaved block.
    ///
    /// Not cancel-safe: dropping the future mid-block loses stream sync.
    pub async fn read_incoming(&self) -> Result<Incoming> {
        let mut reader = self.reader.lock().await;
        read_message(&mut reader).await
    }

    /// Send an interleaved block on `channel`.
    pub async fn write_interleaved(&self, channel: u8, payload: &[u8]) -> Result<()> {
        let len = u16::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interleaved block too large"))?;
        let mut block = BytesMut::with_capacity(4 + payload.len());
        block.put_u8(b'$');
        block.put_u8(channel);
        block.put_u16(len);
        block.put_slice(payload);
        self.write(&block).await
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.lock().await.write(data).await?;
        Ok(())
    }
}

/// Parse one unit off the shared stream by peeking at its first byte.
pub(crate) async fn read_message(reader: &mut ControlReader) -> Result<Incoming> {
    let first = reader.fill_buf().await?.first().copied();

    match first {
        None => Err(RtspError::framing(FramingErrorKind::EndOfStream)),
        Some(b'$') => {
            let mut header = [0u8; 4];
            reader.read_exact(&mut header).await.map_err(read_error)?;
            let channel = header[1];
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;

            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await.map_err(read_error)?;
            Ok(Incoming::Interleaved {
                channel,
                payload: Bytes::from(payload),
            })
        }
        Some(b'R' | b'H' | b'\r' | b'\n') => {
            let head = read_head(reader).await?;
            let response = RtspResponse::parse_head(&head)?;
            let len = response.content_length()?;
            if len > MAX_BODY_SIZE {
                return Err(RtspError::protocol(ProtocolErrorKind::InvalidContentLength));
            }

            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await.map_err(read_error)?;
            Ok(Incoming::Response(response.with_body(body)))
        }
        Some(other) => Err(RtspError::framing(FramingErrorKind::UnexpectedByte(other))),
    }
}

fn read_error(e: io::Error) -> RtspError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RtspError::framing(FramingErrorKind::EndOfStream)
    } else {
        RtspError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    fn reader_over(data: &'static [u8]) -> ControlReader {
        BufReader::new(Box::new(data) as Box<dyn AsyncRead + Send + Unpin>)
    }

    #[tokio::test]
    async fn interleaved_then_response() {
        let mut reader = reader_over(
            b"$\x01\x00\x03abcRTSP/1.0 200 OK\r\nCSeq: 4\r\nContent-Length: 2\r\n\r\nhi",
        );

        let Incoming::Interleaved { channel, payload } = read_message(&mut reader).await.unwrap()
        else {
            panic!("expected interleaved block");
        };
        assert_eq!(channel, 1);
        assert_eq!(&payload[..], b"abc");

        let Incoming::Response(response) = read_message(&mut reader).await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.cseq(), Some(4));
        assert_eq!(response.body, b"hi");

        assert!(matches!(
            read_message(&mut reader).await,
            Err(RtspError::Framing {
                kind: FramingErrorKind::EndOfStream
            })
        ));
    }

    #[tokio::test]
    async fn truncated_block_is_end_of_stream() {
        let mut reader = reader_over(b"$\x00\x00\x10abc");
        assert!(matches!(
            read_message(&mut reader).await,
            Err(RtspError::Framing {
                kind: FramingErrorKind::EndOfStream
            })
        ));
    }

    #[tokio::test]
    async fn garbage_is_framing_error() {
        let mut reader = reader_over(b"\x17junk");
        assert!(matches!(
            read_message(&mut reader).await,
            Err(RtspError::Framing {
                kind: FramingErrorKind::UnexpectedByte(0x17)
            })
        ));
    }

    async fn serve_once(response: &'static str) -> (ConnectionParameters, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut request = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            // A stale response and a media block ahead of the real answer.
            write
                .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 99\r\n\r\n$\x00\x00\x01x")
                .await
                .unwrap();
            write.write_all(response.as_bytes()).await.unwrap();
            request
        });
        let params = ConnectionParameters::new(&format!("rtsp://{addr}/live")).unwrap();
        (params, server)
    }

    #[tokio::test]
    async fn execute_matches_cseq() {
        let (params, server) =
            serve_once("RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: OPTIONS, DESCRIBE\r\n\r\n").await;
        let conn = ControlConnection::connect(&params).await.unwrap();

        let response = conn.execute(|f| f.create_options()).await.unwrap();
        assert_eq!(response.get_header("Public"), Some("OPTIONS, DESCRIBE"));

        let request = server.await.unwrap();
        assert!(request.starts_with("OPTIONS rtsp://127.0.0.1:"));
        assert!(request.contains("CSeq: 1\r\n"));
    }

    #[tokio::test]
    async fn unauthorized_without_credentials() {
        let (params, _server) = serve_once(
            "RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Basic realm=\"cam\"\r\n\r\n",
        )
        .await;
        let conn = ControlConnection::connect(&params).await.unwrap();
        assert!(matches!(
            conn.execute(|f| f.create_describe()).await,
            Err(RtspError::Authentication)
        ));
    }
}
