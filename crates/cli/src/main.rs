use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rtsp_client::{ConnectionParameters, RequiredTracks, RtpTransport, RtspClient, RtspError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
}

#[derive(Parser)]
#[command(name = "rtsp-client", about = "Connect to an RTSP stream and print its frames")]
struct Args {
    /// Stream URI (rtsp:// or http:// for tunnelling); may embed user:password@
    uri: String,

    /// How RTP is delivered
    #[arg(long, short, value_enum, default_value = "tcp")]
    transport: Transport,

    #[arg(long, short)]
    username: Option<String>,

    #[arg(long, short, default_value = "")]
    password: String,

    /// Also set up audio tracks
    #[arg(long)]
    audio: bool,

    /// Also set up data (metadata) tracks
    #[arg(long)]
    data: bool,

    /// Seconds without frames before giving up
    #[arg(long, default_value_t = 10)]
    receive_timeout: u64,
}

impl Args {
    fn params(&self) -> Result<ConnectionParameters, RtspError> {
        let mut tracks = RequiredTracks::VIDEO;
        if self.audio {
            tracks = tracks | RequiredTracks::AUDIO;
        }
        if self.data {
            tracks = tracks | RequiredTracks::DATA;
        }

        let mut params = ConnectionParameters::new(&self.uri)?
            .with_transport(match self.transport {
                Transport::Tcp => RtpTransport::Tcp,
                Transport::Udp => RtpTransport::Udp,
            })
            .with_required_tracks(tracks)
            .with_receive_timeout(Duration::from_secs(self.receive_timeout));
        if let Some(username) = &self.username {
            params = params.with_credentials(username, &self.password);
        }
        Ok(params)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let params = match args.params() {
        Ok(params) => params,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping");
            ctrl_c.cancel();
        }
    });

    let (client, mut frames) = RtspClient::new(params);
    if let Err(e) = client.connect(&token).await {
        eprintln!("connect failed: {e}");
        return ExitCode::FAILURE;
    }
    if let Some(description) = client.description() {
        for (index, track) in description.tracks.iter().enumerate() {
            tracing::info!(
                track = index,
                kind = %track.kind,
                codec = track.codec.name(),
                "track"
            );
        }
    }

    let printer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            println!(
                "track={} kind={} key={} time={:?} bytes={}",
                frame.track,
                frame.kind,
                frame.key_frame,
                frame.timestamp,
                frame.payload.len()
            );
        }
    });

    let result = client.receive(&token).await;
    drop(client);
    let _ = printer.await;

    match result {
        Ok(()) | Err(RtspError::Cancelled) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("receive failed: {e}");
            ExitCode::FAILURE
        }
    }
}
