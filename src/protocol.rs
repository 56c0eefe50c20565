//! Payload and wire shapes shared by the batcher and the HTTP source.
//!
//! The batch endpoint accepts `{"artists": [...], "lang": "ru"}` and answers
//! with `{"artists": {"<name>": {...}}, "meta": {...}}`.

use std::collections::HashMap;

/// How a resolved [`ArtistBio`] came to be.
///
/// Not part of the wire format: the endpoint only ever sends found entries,
/// everything else is synthesized client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupStatus {
    /// The endpoint returned an entry for the key.
    #[default]
    Found,
    /// The batch succeeded but had no entry for the key.
    NotFound,
    /// The batch carrying the key failed.
    Error,
    /// The key was empty after trimming and never reached the network.
    Empty,
}

/// Artist biography record rendered by the bio modal.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub struct ArtistBio {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub lang: String,
    #[serde(skip)]
    pub status: LookupStatus,
}

impl ArtistBio {
    /// Placeholder shown when no real biography is available for `artist`.
    pub fn fallback(artist: &str, status: LookupStatus) -> Self {
        Self {
            title: artist.to_string(),
            bio: String::new(),
            image_url: String::new(),
            source_url: String::new(),
            lang: String::new(),
            status,
        }
    }

    /// Returns `true` when the record carries a real lookup result.
    pub fn is_found(&self) -> bool {
        self.status == LookupStatus::Found
    }
}

/// Request body posted to the batch endpoint.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BatchRequest<'a> {
    pub artists: &'a [String],
    pub lang: &'a str,
}

/// Response metadata echoed by the batch endpoint.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct BatchMeta {
    #[serde(default)]
    pub lang_requested: String,
    #[serde(default)]
    pub count: usize,
}

/// Decoded batch response: found artists keyed by the name that was sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub artists: HashMap<String, ArtistBio>,
    pub meta: BatchMeta,
}

impl BatchResponse {
    /// Decodes a response body leniently.
    ///
    /// A missing or non-object `artists` field yields an empty map, and
    /// malformed entries are dropped so they surface as "not found".
    pub fn from_value(value: &serde_json::Value) -> Self {
        let mut artists = HashMap::new();
        if let Some(entries) = value.get("artists").and_then(serde_json::Value::as_object) {
            for (name, entry) in entries {
                let Ok(mut bio) = serde_json::from_value::<ArtistBio>(entry.clone()) else {
                    log::debug!("Dropping malformed batch entry for {}", name);
                    continue;
                };
                if bio.title.trim().is_empty() {
                    bio.title = name.clone();
                }
                artists.insert(name.clone(), bio);
            }
        }
        let meta = value
            .get("meta")
            .and_then(|meta| serde_json::from_value::<BatchMeta>(meta.clone()).ok())
            .unwrap_or_default();
        Self { artists, meta }
    }
}

#[cfg(test)]
mod tests {
    use super::{ArtistBio, BatchRequest, BatchResponse, LookupStatus};
    use serde_json::json;

    #[test]
    fn test_fallback_uses_supplied_name_and_empty_fields() {
        let bio = ArtistBio::fallback("Bowie", LookupStatus::Error);
        assert_eq!(bio.title, "Bowie");
        assert!(bio.bio.is_empty());
        assert!(bio.image_url.is_empty());
        assert!(bio.source_url.is_empty());
        assert!(bio.lang.is_empty());
        assert!(!bio.is_found());
    }

    #[test]
    fn test_request_serializes_artists_and_lang() {
        let artists = vec!["Muse".to_string()];
        let body = serde_json::to_string(&BatchRequest {
            artists: &artists,
            lang: "ru",
        })
        .expect("request should serialize");
        assert_eq!(body, r#"{"artists":["Muse"],"lang":"ru"}"#);
    }

    #[test]
    fn test_response_decodes_entries_and_defaults_title() {
        let response = BatchResponse::from_value(&json!({
            "artists": {
                "Muse": { "bio": "bio", "image_url": "", "source_url": "", "lang": "ru" },
                "Adele": { "title": "Adele Adkins", "bio": "hello" }
            },
            "meta": { "lang_requested": "ru", "count": 2 }
        }));
        let muse = &response.artists["Muse"];
        assert_eq!(muse.title, "Muse");
        assert_eq!(muse.bio, "bio");
        assert_eq!(muse.status, LookupStatus::Found);
        assert_eq!(response.artists["Adele"].title, "Adele Adkins");
        assert_eq!(response.meta.count, 2);
    }

    #[test]
    fn test_response_without_artists_object_is_empty() {
        assert!(BatchResponse::from_value(&json!({ "artists": [] }))
            .artists
            .is_empty());
        assert!(BatchResponse::from_value(&json!("nope")).artists.is_empty());
    }

    #[test]
    fn test_response_drops_malformed_entries() {
        let response = BatchResponse::from_value(&json!({
            "artists": { "Muse": "not an object", "Blur": { "bio": "ok" } }
        }));
        assert!(!response.artists.contains_key("Muse"));
        assert_eq!(response.artists["Blur"].bio, "ok");
    }
}
