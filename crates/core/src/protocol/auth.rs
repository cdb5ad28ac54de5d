//! RTSP authentication (RFC 2326 §D.1, RFC 2617).
//!
//! The server signals that credentials are required by answering `401` with
//! one or more `WWW-Authenticate` challenges. We answer the strongest scheme
//! we understand once; a second `401` is reported as
//! [`RtspError::Authentication`](crate::RtspError::Authentication).

use std::fmt;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use rand::Rng;

use crate::error::{ProtocolErrorKind, Result, RtspError};

/// Username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Produces `Authorization` header values for a negotiated scheme.
#[derive(Debug, Clone)]
pub enum Authenticator {
    Basic {
        credentials: Credentials,
    },
    Digest {
        credentials: Credentials,
        realm: String,
        nonce: String,
        opaque: Option<String>,
        qop_auth: bool,
        nonce_count: u32,
    },
}

impl Authenticator {
    /// Pick a scheme from the `WWW-Authenticate` values of a 401 response.
    ///
    /// Digest is preferred over Basic when both are offered.
    pub fn from_challenges<'a>(
        credentials: &Credentials,
        challenges: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let mut basic = false;

        for challenge in challenges {
            let challenge = challenge.trim();
            let (scheme, rest) = challenge.split_once(' ').unwrap_or((challenge, ""));

            if scheme.eq_ignore_ascii_case("Digest") {
                let params = parse_params(rest);
                let get = |name: &str| {
                    params
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(name))
                        .map(|(_, v)| v.clone())
                };

                let (Some(realm), Some(nonce)) = (get("realm"), get("nonce")) else {
                    return Err(RtspError::protocol(
                        ProtocolErrorKind::UnsupportedAuthentication,
                    ));
                };
                let qop_auth = get("qop")
                    .is_some_and(|qop| qop.split(',').any(|q| q.trim() == "auth"));

                return Ok(Self::Digest {
                    credentials: credentials.clone(),
                    realm,
                    nonce,
                    opaque: get("opaque"),
                    qop_auth,
                    nonce_count: 0,
                });
            }

            if scheme.eq_ignore_ascii_case("Basic") {
                basic = true;
            }
        }

        if basic {
            Ok(Self::Basic {
                credentials: credentials.clone(),
            })
        } else {
            Err(RtspError::protocol(
                ProtocolErrorKind::UnsupportedAuthentication,
            ))
        }
    }

    /// Header value for a request with the given method and URI. The
    /// method is a string so HTTP tunnel requests can be signed too.
    pub fn authorization(&mut self, method: &str, uri: &str) -> String {
        match self {
            Self::Basic { credentials } => {
                let token = format!("{}:{}", credentials.username, credentials.password);
                format!("Basic {}", BASE64_STANDARD.encode(token))
            }
            Self::Digest {
                credentials,
                realm,
                nonce,
                opaque,
                qop_auth,
                nonce_count,
            } => {
                let ha1 = md5_hex(&format!(
                    "{}:{}:{}",
                    credentials.username, realm, credentials.password
                ));
                let ha2 = md5_hex(&format!("{method}:{uri}"));

                let mut header = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
                    credentials.username, realm, nonce, uri
                );

                if *qop_auth {
                    *nonce_count += 1;
                    let nc = format!("{:08x}", nonce_count);
                    let cnonce = format!("{:08x}", rand::rng().random::<u32>());
                    let response = md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"));
                    header.push_str(&format!(
                        ", response=\"{response}\", qop=auth, nc={nc}, cnonce=\"{cnonce}\""
                    ));
                } else {
                    let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
                    header.push_str(&format!(", response=\"{response}\""));
                }

                if let Some(opaque) = opaque {
                    header.push_str(&format!(", opaque=\"{opaque}\""));
                }
                header
            }
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Split `key="value", key=value` challenge parameters. Commas inside
/// quoted values (e.g. `qop="auth,auth-int"`) are kept.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        params.push((key, value.trim().to_string()));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("Mufasa", "Circle Of Life")
    }

    #[test]
    fn basic_authorization() {
        let mut auth = Authenticator::from_challenges(&creds(), ["Basic realm=\"cam\""]).unwrap();
        assert_eq!(
            auth.authorization("DESCRIBE", "rtsp://cam/live"),
            "Basic TXVmYXNhOkNpcmNsZSBPZiBMaWZl"
        );
    }

    #[test]
    fn digest_preferred_over_basic() {
        let auth = Authenticator::from_challenges(
            &creds(),
            ["Basic realm=\"cam\"", "Digest realm=\"cam\", nonce=\"abc\""],
        )
        .unwrap();
        assert!(matches!(auth, Authenticator::Digest { .. }));
    }

    #[test]
    fn digest_rfc2617_vector() {
        // RFC 2617 §3.5 example, with the HTTP method and URI substituted.
        let mut auth = Authenticator::Digest {
            credentials: creds(),
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            qop_auth: false,
            nonce_count: 0,
        };
        let header = auth.authorization("DESCRIBE", "rtsp://host/stream");

        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("DESCRIBE:rtsp://host/stream");
        let expected = md5_hex(&format!("{ha1}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{ha2}"));

        assert!(header.starts_with("Digest username=\"Mufasa\""));
        assert!(header.contains(&format!("response=\"{expected}\"")));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
        assert!(!header.contains("qop"));
    }

    #[test]
    fn digest_with_qop_counts_nonces() {
        let mut auth = Authenticator::from_challenges(
            &creds(),
            ["Digest realm=\"cam\", qop=\"auth,auth-int\", nonce=\"n1\""],
        )
        .unwrap();
        let first = auth.authorization("OPTIONS", "rtsp://cam/");
        let second = auth.authorization("OPTIONS", "rtsp://cam/");
        assert!(first.contains("qop=auth, nc=00000001"));
        assert!(second.contains("nc=00000002"));
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(Authenticator::from_challenges(&creds(), ["Negotiate abc"]).is_err());
    }

    #[test]
    fn password_not_in_debug() {
        assert!(!format!("{:?}", creds()).contains("Circle"));
    }
}
