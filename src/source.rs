//! Batch lookup sources: the network side of the batcher.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::config::EndpointConfig;
use crate::error::LookupError;
use crate::protocol::{ArtistBio, BatchRequest, BatchResponse, LookupStatus};

/// Interface implemented by batch-capable lookup backends.
pub trait BatchSource: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    /// Fetches payloads for `keys` in one round trip.
    ///
    /// The returned map is keyed by the strings in `keys`. Keys missing from
    /// it are "not found", not an error.
    fn fetch_batch(&self, keys: &[String]) -> Result<HashMap<String, Self::Payload>, LookupError>;

    /// Placeholder for `raw_key` when no real payload is available.
    fn fallback(&self, raw_key: &str, status: LookupStatus) -> Self::Payload;

    /// Short label used in log lines.
    fn label(&self) -> &str {
        "batch"
    }
}

/// Artist biography source that POSTs name lists to the Wikipedia batch endpoint.
pub struct WikipediaArtistSource {
    http_client: ureq::Agent,
    endpoint: String,
    lang: String,
    user_agent: String,
    extra_headers: BTreeMap<String, String>,
}

impl WikipediaArtistSource {
    pub fn new(config: &EndpointConfig) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(config.read_timeout_secs))
            .timeout_write(Duration::from_secs(config.read_timeout_secs))
            .build();

        Self {
            http_client,
            endpoint: config.url.clone(),
            lang: config.lang.clone(),
            user_agent: config.user_agent.clone(),
            extra_headers: config.extra_headers.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn error_message_from_body(body: &str) -> Option<String> {
        serde_json::from_str::<Value>(body)
            .ok()?
            .get("error")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
    }

    fn map_request_error(error: ureq::Error) -> LookupError {
        match error {
            ureq::Error::Status(status, response) => {
                let status_text = response.status_text().to_string();
                let body = response.into_string().unwrap_or_default();
                LookupError::Status {
                    status,
                    message: Self::error_message_from_body(&body).unwrap_or(status_text),
                }
            }
            ureq::Error::Transport(transport) => LookupError::Transport(transport.to_string()),
        }
    }
}

impl BatchSource for WikipediaArtistSource {
    type Payload = ArtistBio;

    fn fetch_batch(&self, keys: &[String]) -> Result<HashMap<String, ArtistBio>, LookupError> {
        let mut request = self
            .http_client
            .post(&self.endpoint)
            .set("User-Agent", &self.user_agent)
            .set("Accept", "application/json")
            .set("Content-Type", "application/json");
        for (name, value) in &self.extra_headers {
            request = request.set(name, value);
        }

        let response = request
            .send_json(BatchRequest {
                artists: keys,
                lang: &self.lang,
            })
            .map_err(Self::map_request_error)?;
        let body: Value = response
            .into_json()
            .map_err(|error| LookupError::Decode(error.to_string()))?;
        let decoded = BatchResponse::from_value(&body);
        debug!(
            "Wikipedia batch answered {} of {} artists (lang={})",
            decoded.artists.len(),
            keys.len(),
            decoded.meta.lang_requested
        );
        Ok(decoded.artists)
    }

    fn fallback(&self, raw_key: &str, status: LookupStatus) -> ArtistBio {
        ArtistBio::fallback(raw_key, status)
    }

    fn label(&self) -> &str {
        "wikipedia"
    }
}
