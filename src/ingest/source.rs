use crate::ingest::rate_limiter::BackoffPolicy;
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const LISTING_BASE_URL: &str = "https://cuescore.com";
pub const API_BASE_URL: &str = "https://api.cuescore.com";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Timeouts, connection resets, 5xx and throttling. Worth retrying.
    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("source rejected the request (status {status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },

    #[error("malformed response: {0}")]
    Malformed(String)
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }

    pub fn from_status(status: StatusCode, url: &Url) -> SourceError {
        let message = format!("{} returned {}", url, status);

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
            SourceError::Transient(message)
        } else {
            SourceError::Permanent {
                status: Some(status.as_u16()),
                message
            }
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return SourceError::Transient(e.to_string());
            }

            return SourceError::Permanent {
                status: Some(status.as_u16()),
                message: e.to_string()
            };
        }

        if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else if e.is_builder() {
            SourceError::Permanent {
                status: None,
                message: e.to_string()
            }
        } else {
            // Timeouts, connect failures and broken bodies
            SourceError::Transient(e.to_string())
        }
    }
}

/// A venue whose tournament listing is crawled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueConfig {
    pub id: i64,
    /// Name as it appears in the listing URL
    pub name: String
}

impl VenueConfig {
    pub fn new(id: i64, name: impl Into<String>) -> VenueConfig {
        VenueConfig { id, name: name.into() }
    }
}

/// Warsaw pool venues tracked by default
pub fn default_venues() -> Vec<VenueConfig> {
    vec![
        VenueConfig::new(2842336, "147 Break Zamieniecka"),
        VenueConfig::new(29830615, "147 Break Fort Wola"),
        VenueConfig::new(1698108, "147 Break Nowogrodzka"),
        VenueConfig::new(57050170, "Shooters"),
        VenueConfig::new(3367445, "Eighty Nine"),
        VenueConfig::new(36031138, "Złota Bila - Centrum Bilardowe"),
        VenueConfig::new(2357769, "Billboard pool & snooker"),
        VenueConfig::new(1634568, "Klub Pictures"),
        VenueConfig::new(22253992, "The Lounge - Billiards Club"),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub listing_base: String,
    pub api_base: String,
    /// Minimum spacing between two requests to the same origin
    pub request_interval: Duration,
    pub timeout: Duration,
    pub user_agent: String,
    /// Upper bound on listing pages crawled per venue
    pub max_pages: u32,
    pub backoff: BackoffPolicy
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings {
            listing_base: LISTING_BASE_URL.to_owned(),
            api_base: API_BASE_URL.to_owned(),
            request_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned(),
            max_pages: 50,
            backoff: BackoffPolicy::default()
        }
    }
}

/// Raw access to the results service. Implementations do no rate limiting or retrying;
/// callers wrap each call in the limiter for the matching origin.
#[allow(async_fn_in_trait)]
pub trait ResultsSource {
    /// HTML of one page of a venue's tournament listing. Pages start at 1.
    async fn listing_page(&self, venue: &VenueConfig, page: u32) -> Result<String, SourceError>;

    /// The structured document for one tournament, verbatim
    async fn tournament_payload(&self, tournament_id: i64) -> Result<Vec<u8>, SourceError>;
}

pub struct HttpSource {
    client: Client,
    settings: SourceSettings
}

impl HttpSource {
    pub fn new(settings: SourceSettings) -> Result<HttpSource, SourceError> {
        let client = ClientBuilder::new()
            .user_agent(settings.user_agent.as_str())
            .timeout(settings.timeout)
            .build()?;

        Ok(HttpSource { client, settings })
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    /// `{base}/venue/{name}/{id}/tournaments`, with `?page=N` from the second page on
    pub fn listing_url(&self, venue: &VenueConfig, page: u32) -> Result<Url, SourceError> {
        let mut url = parse_base(&self.settings.listing_base)?;
        url.path_segments_mut()
            .map_err(|_| invalid_base(&self.settings.listing_base))?
            .pop_if_empty()
            .push("venue")
            .push(&venue.name)
            .push(&venue.id.to_string())
            .push("tournaments");

        if page > 1 {
            url.query_pairs_mut().append_pair("page", &page.to_string());
        }

        Ok(url)
    }

    /// `{api}/tournament/?id={id}`
    pub fn tournament_url(&self, tournament_id: i64) -> Result<Url, SourceError> {
        let mut url = parse_base(&self.settings.api_base)?;
        url.path_segments_mut()
            .map_err(|_| invalid_base(&self.settings.api_base))?
            .pop_if_empty()
            .push("tournament")
            .push("");
        url.query_pairs_mut().append_pair("id", &tournament_id.to_string());

        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, SourceError> {
        debug!("GET {}", url);
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(SourceError::from_status(response.status(), &url));
        }

        Ok(response)
    }
}

impl ResultsSource for HttpSource {
    async fn listing_page(&self, venue: &VenueConfig, page: u32) -> Result<String, SourceError> {
        let url = self.listing_url(venue, page)?;

        Ok(self.get(url).await?.text().await?)
    }

    async fn tournament_payload(&self, tournament_id: i64) -> Result<Vec<u8>, SourceError> {
        let url = self.tournament_url(tournament_id)?;
        let body = self.get(url).await?.bytes().await?;

        // Only check that it is JSON; shape problems are the normalizer's to report
        serde_json::from_slice::<serde_json::Value>(&body)
            .map_err(|e| SourceError::Malformed(format!("tournament {}: {}", tournament_id, e)))?;

        Ok(body.to_vec())
    }
}

fn parse_base(base: &str) -> Result<Url, SourceError> {
    Url::parse(base).map_err(|_| invalid_base(base))
}

fn invalid_base(base: &str) -> SourceError {
    SourceError::Permanent {
        status: None,
        message: format!("invalid base url '{}'", base)
    }
}
