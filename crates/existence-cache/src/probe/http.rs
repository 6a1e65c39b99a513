use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;

use super::{ProbeClient, ProbeError};
use crate::config::OriginConfig;

/// Creates a [`reqwest::Client`] for probing.
///
/// `head_timeout` bounds the whole request. Probes never download a body, so there is no
/// separate streaming timeout.
fn create_client(connect_timeout: Duration, head_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .hickory_dns(true)
        .connect_timeout(connect_timeout)
        .timeout(head_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Makes sure `url` is treated as a directory by [`Url::join`].
pub(crate) fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Probes the icon origin with `HEAD {origin}/assets/icon/check?asset_id=<identifier>`.
#[derive(Debug, Clone)]
pub struct HttpProbeClient {
    client: reqwest::Client,
    check_url: Url,
    use_collection_icon: bool,
}

impl HttpProbeClient {
    pub fn new(config: &OriginConfig) -> anyhow::Result<Self> {
        let client = create_client(config.connect_timeout, config.head_timeout)?;
        let check_url = ensure_trailing_slash(config.url.clone()).join("assets/icon/check")?;

        Ok(Self {
            client,
            check_url,
            use_collection_icon: config.use_collection_icon,
        })
    }

    fn check_url(&self, identifier: &str) -> Url {
        let mut url = self.check_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("asset_id", identifier);
            if self.use_collection_icon {
                query.append_pair("use_collection_icon", "true");
            }
        }
        url
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn probe(
        &self,
        identifier: &str,
        _cancel: &CancellationToken,
    ) -> Result<StatusCode, ProbeError> {
        let url = self.check_url(identifier);
        tracing::trace!(%url, "Probing origin");

        let response = self.client.head(url).send().await?;
        Ok(response.status())
    }
}
