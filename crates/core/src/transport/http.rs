//! RTSP-over-HTTP tunnelling.
//!
//! ```text
//! GET  /path HTTP/1.0          (server -> client, plain RTSP)
//! x-sessioncookie: <cookie>
//! Accept: application/x-rtsp-tunnelled
//!
//! POST /path HTTP/1.0          (client -> server, base64 RTSP)
//! x-sessioncookie: <cookie>
//! Content-Type: application/x-rtsp-tunnelled
//! ```
//!
//! The shared cookie lets the server pair the two connections. The GET
//! reply is a normal HTTP head after which the body is the RTSP stream.

use std::net::SocketAddr;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;

use super::{ControlReader, read_head};
use crate::config::ConnectionParameters;
use crate::error::{Result, RtspError};
use crate::protocol::RtspResponse;
use crate::protocol::auth::Authenticator;

const TUNNEL_CONTENT_TYPE: &str = "application/x-rtsp-tunnelled";

/// The two halves of an established tunnel.
pub(crate) struct Tunnel {
    pub reader: ControlReader,
    /// Write half of the GET connection, held to keep it open.
    pub get: OwnedWriteHalf,
    pub post: TcpStream,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Open the GET and POST connections for `params.uri`.
///
/// An HTTP `401` on the GET is retried once with credentials on a fresh
/// connection.
pub(crate) async fn open(params: &ConnectionParameters) -> Result<Tunnel> {
    let cookie = format!("{:016x}", rand::rng().random::<u64>());
    let path = tunnel_path(params);
    let mut authenticator: Option<Authenticator> = None;

    let (reader, get, peer_addr, local_addr) = loop {
        let stream = connect(params).await?;
        let peer_addr = stream.peer_addr().map_err(RtspError::Connection)?;
        let local_addr = stream.local_addr().map_err(RtspError::Connection)?;
        let (read, mut write) = stream.into_split();

        let mut request = format!(
            "GET {path} HTTP/1.0\r\n\
             x-sessioncookie: {cookie}\r\n\
             Accept: {TUNNEL_CONTENT_TYPE}\r\n\
             Pragma: no-cache\r\n\
             Cache-Control: no-cache\r\n\
             User-Agent: {}\r\n",
            params.user_agent
        );
        if let Some(auth) = authenticator.as_mut() {
            request.push_str(&format!("Authorization: {}\r\n", auth.authorization("GET", &path)));
        }
        request.push_str("\r\n");
        write.write_all(request.as_bytes()).await?;

        let mut reader: ControlReader =
            BufReader::new(Box::new(read) as Box<dyn AsyncRead + Send + Unpin>);
        let response = RtspResponse::parse_head(&read_head(&mut reader).await?)?;
        tracing::debug!(status = response.status_code, "tunnel GET response");

        if response.is_unauthorized() {
            let Some(credentials) = params.credentials.as_ref() else {
                return Err(RtspError::Authentication);
            };
            if authenticator.is_some() {
                return Err(RtspError::Authentication);
            }
            authenticator = Some(Authenticator::from_challenges(
                credentials,
                response.get_headers("WWW-Authenticate"),
            )?);
            continue;
        }
        response.ensure_success()?;
        break (reader, write, peer_addr, local_addr);
    };

    let mut post = connect(params).await?;
    let mut request = format!(
        "POST {path} HTTP/1.0\r\n\
         x-sessioncookie: {cookie}\r\n\
         Content-Type: {TUNNEL_CONTENT_TYPE}\r\n\
         Pragma: no-cache\r\n\
         Cache-Control: no-cache\r\n\
         Content-Length: 32767\r\n\
         Expires: Sun, 9 Jan 1972 00:00:00 GMT\r\n\
         User-Agent: {}\r\n",
        params.user_agent
    );
    if let Some(auth) = authenticator.as_mut() {
        request.push_str(&format!("Authorization: {}\r\n", auth.authorization("POST", &path)));
    }
    request.push_str("\r\n");
    post.write_all(request.as_bytes()).await?;

    tracing::debug!(%peer_addr, cookie = %cookie, "HTTP tunnel established");
    Ok(Tunnel {
        reader,
        get,
        post,
        peer_addr,
        local_addr,
    })
}

async fn connect(params: &ConnectionParameters) -> Result<TcpStream> {
    let stream = TcpStream::connect((params.host(), params.port()))
        .await
        .map_err(RtspError::Connection)?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

fn tunnel_path(params: &ConnectionParameters) -> String {
    match params.uri.query() {
        Some(query) => format!("{}?{}", params.uri.path(), query),
        None => params.uri.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpListener;

    use super::*;

    async fn read_request(stream: &mut BufReader<TcpStream>) -> String {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            head.push_str(&line);
            if line == "\r\n" || line.is_empty() {
                return head;
            }
        }
    }

    #[tokio::test]
    async fn tunnel_pairs_get_and_post() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (get, _) = listener.accept().await.unwrap();
            let mut get = BufReader::new(get);
            let get_head = read_request(&mut get).await;
            get.get_mut()
                .write_all(b"HTTP/1.0 200 OK\r\nContent-Type: application/x-rtsp-tunnelled\r\n\r\n")
                .await
                .unwrap();

            let (post, _) = listener.accept().await.unwrap();
            let mut post = BufReader::new(post);
            let post_head = read_request(&mut post).await;
            let mut body = vec![0u8; 8];
            post.read_exact(&mut body).await.unwrap();
            (get_head, post_head, body, get)
        });

        let params = ConnectionParameters::new(&format!("http://{addr}/cam?ch=1")).unwrap();
        let mut tunnel = open(&params).await.unwrap();
        tunnel.post.write_all(b"T1BUSU9O").await.unwrap();

        let (get_head, post_head, body, _get) = server.await.unwrap();
        assert!(get_head.starts_with("GET /cam?ch=1 HTTP/1.0\r\n"));
        assert!(post_head.starts_with("POST /cam?ch=1 HTTP/1.0\r\n"));

        let cookie = |head: &str| {
            head.lines()
                .find_map(|l| l.strip_prefix("x-sessioncookie: "))
                .map(str::to_string)
        };
        assert!(cookie(&get_head).is_some());
        assert_eq!(cookie(&get_head), cookie(&post_head));
        assert_eq!(body, b"T1BUSU9O");
    }

    #[tokio::test]
    async fn http_unauthorized_without_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (get, _) = listener.accept().await.unwrap();
            let mut get = BufReader::new(get);
            read_request(&mut get).await;
            get.get_mut()
                .write_all(b"HTTP/1.0 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"x\"\r\n\r\n")
                .await
                .unwrap();
        });

        let params = ConnectionParameters::new(&format!("http://{addr}/cam")).unwrap();
        assert!(matches!(open(&params).await, Err(RtspError::Authentication)));
    }
}
