//! Building URLs under which a resource can be displayed.
//!
//! Display URLs carry a cache-busting marker. Whoever renders them (and caches the rendered
//! bytes) sees a different URL after every invalidation and fetches the resource again.

use url::Url;

use crate::config::OriginConfig;
use crate::probe::ensure_trailing_slash;

/// Turns an identifier and a cache-busting marker into a display URL.
pub trait DisplayUrl: Send + Sync {
    fn display_url(&self, identifier: &str, marker: u64) -> String;
}

impl<F> DisplayUrl for F
where
    F: Fn(&str, u64) -> String + Send + Sync,
{
    fn display_url(&self, identifier: &str, marker: u64) -> String {
        self(identifier, marker)
    }
}

/// Builds `{origin}/assets/icon?asset_id=<identifier>&timestamp=<marker>`.
#[derive(Clone, Debug)]
pub struct IconUrlBuilder {
    icon_url: Url,
    use_collection_icon: bool,
}

impl IconUrlBuilder {
    pub fn new(config: &OriginConfig) -> Result<Self, url::ParseError> {
        let icon_url = ensure_trailing_slash(config.url.clone()).join("assets/icon")?;
        Ok(Self {
            icon_url,
            use_collection_icon: config.use_collection_icon,
        })
    }
}

impl DisplayUrl for IconUrlBuilder {
    fn display_url(&self, identifier: &str, marker: u64) -> String {
        let mut url = self.icon_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("asset_id", identifier);
            query.append_pair("timestamp", &marker.to_string());
            if self.use_collection_icon {
                query.append_pair("use_collection_icon", "true");
            }
        }
        url.into()
    }
}
