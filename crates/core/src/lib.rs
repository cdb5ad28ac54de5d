pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod rtcp;
pub mod session;
pub mod stream;
pub mod transport;

pub use client::RtspClient;
pub use config::{ConnectionParameters, RequestParams, RequiredTracks, RtpTransport};
pub use error::{Result, RtspError, TimeoutKind};
pub use media::{Frame, MediaKind};
pub use session::SessionDescription;
