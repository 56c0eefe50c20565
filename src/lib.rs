//! Client-side batched lookup cache for artist biographies.
//!
//! UI handlers call [`Batcher::queue`] for one artist and
//! [`Batcher::prefetch_many`] for a rendered page of artists. The batcher
//! coalesces those calls into as few POSTs to the biography endpoint as
//! possible and memoizes the answers for the session.

pub mod batcher;
pub mod config;
pub mod error;
pub mod key;
pub mod protocol;
pub mod scheduler;
pub mod source;

pub use batcher::{Batcher, BatcherOptions, PendingLookup};
pub use config::{sanitize_config, BatchingConfig, Config, EndpointConfig};
pub use error::{ConfigError, LookupError};
pub use key::{normalize_key, LookupKey};
pub use protocol::{ArtistBio, LookupStatus};
pub use scheduler::{ManualScheduler, Scheduler, Task, TokioScheduler};
pub use source::{BatchSource, WikipediaArtistSource};

/// Batcher wired to the Wikipedia artist endpoint described by `config`.
pub fn wikipedia_artist_batcher(
    config: &Config,
    scheduler: std::sync::Arc<dyn Scheduler>,
) -> Batcher<WikipediaArtistSource> {
    Batcher::new(
        WikipediaArtistSource::new(&config.endpoint),
        scheduler,
        BatcherOptions::from(&config.batching),
    )
}
