//! Credentials and endpoint construction for the realtime socket.
//!
//! The backend authenticates the WebSocket upgrade with a `token` query
//! parameter. Where the token comes from (a cookie jar, a keychain, a test
//! fixture) is the application's business, so it is injected through
//! [`CredentialProvider`]. How the URL is built is injected through
//! [`EndpointBuilder`], with [`QueryTokenEndpoint`] covering the usual case.
//!
//! ## Example
//!
//! ```rust
//! # use conversation_realtime_kit::auth::{Credential, EndpointBuilder, QueryTokenEndpoint};
//! let endpoint = QueryTokenEndpoint::new("https://api.example.com", "/ws/conversations/monitor/")?;
//! let url = endpoint.build(&Credential::new("abc123"))?;
//! assert_eq!(url.as_str(), "wss://api.example.com/ws/conversations/monitor/?token=abc123");
//! # Ok::<(), conversation_realtime_kit::Error>(())
//! ```

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use std::fmt;
use url::Url;

/// An opaque authentication token.
///
/// The token is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A blank token cannot authenticate anything and is treated as missing.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Supplies the current credential, if the user is logged in.
pub trait CredentialProvider: Send + Sync + 'static {
    fn credential(&self) -> Option<Credential>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<Credential> + Send + Sync + 'static,
{
    fn credential(&self) -> Option<Credential> {
        self()
    }
}

/// Builds the socket URL for a credential.
pub trait EndpointBuilder: Send + Sync + 'static {
    fn build(&self, credential: &Credential) -> Result<Url>;
}

/// Base URL + path, with the credential as the `token` query parameter.
///
/// `http` and `https` bases are mapped to `ws` and `wss`.
#[derive(Debug, Clone)]
pub struct QueryTokenEndpoint {
    base: Url,
}

impl QueryTokenEndpoint {
    pub fn new(base_url: &str, path: &str) -> Result<Self> {
        let mut base = Url::parse(base_url.trim())?;
        let scheme = match base.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported base_url scheme '{other}'; expected http(s) or ws(s)"
                )));
            }
        };
        base.set_scheme(scheme)
            .map_err(|_| Error::Configuration("failed to set WebSocket URL scheme".into()))?;

        let joined = format!(
            "{}/{}",
            base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        base.set_path(&joined);
        base.set_query(None);
        base.set_fragment(None);

        Ok(Self { base })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(&config.base_url, &config.path)
    }
}

impl EndpointBuilder for QueryTokenEndpoint {
    fn build(&self, credential: &Credential) -> Result<Url> {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("token", credential.as_str());
        Ok(url)
    }
}
