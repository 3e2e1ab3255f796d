//! HTTP plumbing shared by feed sources.

use reqwest::Client;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{ClientSnafu, DecodeSnafu, FeedError, RequestSnafu, StatusSnafu};

const USER_AGENT: &str = concat!("drover/", env!("CARGO_PKG_VERSION"));

/// A JSON-over-HTTP client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(USER_AGENT)
            .build()
            .context(ClientSnafu)?;
        Ok(Self { client })
    }

    /// GET `url` and decode the body as `T`.
    ///
    /// Transport failures map to `Request`, non-2xx answers to `Status`, and
    /// bodies that do not decode to `Decode`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        headers: &[(&'static str, &str)],
    ) -> Result<T, FeedError> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .context(RequestSnafu { url: url.as_str() })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                url: url.as_str(),
                status: status.as_u16(),
            }
        );

        let body = response
            .bytes()
            .await
            .context(RequestSnafu { url: url.as_str() })?;
        debug!(url = %url, bytes = body.len(), "Fetched");

        serde_json::from_slice(&body).context(DecodeSnafu { url: url.as_str() })
    }
}
