//! The REST fallback for the authoritative unread total.

use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// Body of the unread-count endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UnreadCountResponse {
    pub total_unread_count: u64,
}

/// Fetches the authoritative unread total.
///
/// Implementations should not retry; the reconciler re-polls on the next
/// trigger and a failed poll leaves the current total in place.
#[async_trait]
pub trait UnreadCountSource: Send + Sync + 'static {
    async fn fetch_total_unread(&self) -> Result<u64>;
}

#[cfg(feature = "http")]
pub use self::http::{DEFAULT_UNREAD_COUNT_PATH, HttpUnreadCountSource};

#[cfg(feature = "http")]
mod http {
    use super::{UnreadCountResponse, UnreadCountSource};
    use crate::auth::CredentialProvider;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::Arc;
    use tracing::{debug, instrument};
    use url::Url;

    pub const DEFAULT_UNREAD_COUNT_PATH: &str = "/api/conversations/unread-count/";

    /// `GET {base}{path}` with the current credential as a bearer token.
    #[derive(Clone)]
    pub struct HttpUnreadCountSource {
        client: reqwest::Client,
        url: Url,
        credentials: Arc<dyn CredentialProvider>,
    }

    impl std::fmt::Debug for HttpUnreadCountSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("HttpUnreadCountSource")
                .field("url", &self.url.as_str())
                .finish_non_exhaustive()
        }
    }

    impl HttpUnreadCountSource {
        pub fn new(
            base_url: &str,
            path: &str,
            credentials: impl CredentialProvider,
        ) -> Result<Self> {
            Self::with_client(reqwest::Client::new(), base_url, path, credentials)
        }

        pub fn with_client(
            client: reqwest::Client,
            base_url: &str,
            path: &str,
            credentials: impl CredentialProvider,
        ) -> Result<Self> {
            let mut url = Url::parse(base_url.trim())?;
            let joined = format!(
                "{}/{}",
                url.path().trim_end_matches('/'),
                path.trim_start_matches('/')
            );
            url.set_path(&joined);
            Ok(Self {
                client,
                url,
                credentials: Arc::new(credentials),
            })
        }
    }

    #[async_trait]
    impl UnreadCountSource for HttpUnreadCountSource {
        #[instrument(skip_all, fields(url = %self.url))]
        async fn fetch_total_unread(&self) -> Result<u64> {
            let credential = self
                .credentials
                .credential()
                .filter(|c| !c.is_blank())
                .ok_or_else(|| Error::Unauthorized("no credential for unread poll".into()))?;

            let response = self
                .client
                .get(self.url.clone())
                .bearer_auth(credential.as_str())
                .send()
                .await
                .map_err(|e| Error::Poll(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::Unauthorized(format!("unread poll returned {status}")));
            }
            if !status.is_success() {
                return Err(Error::Poll(format!("unread poll returned {status}")));
            }

            let body: UnreadCountResponse = response
                .json()
                .await
                .map_err(|e| Error::Poll(e.to_string()))?;
            debug!(total = body.total_unread_count, "Fetched unread total");
            Ok(body.total_unread_count)
        }
    }
}
