use std::sync::Arc;

use artist_bio_batcher::config::{default_config_path, load_or_create_config};
use artist_bio_batcher::{sanitize_config, wikipedia_artist_batcher, Config, TokioScheduler};
use log::{info, warn};

fn load_config() -> Config {
    let Some(path) = default_config_path() else {
        warn!("No config directory available. Using default config.");
        return sanitize_config(Config::default());
    };
    match load_or_create_config(&path) {
        Ok(config) => config,
        Err(error) => {
            warn!(
                "Failed to load config from {}: {}. Using default config.",
                path.display(),
                error
            );
            sanitize_config(Config::default())
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Info);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let artists: Vec<String> = std::env::args().skip(1).collect();
    if artists.is_empty() {
        eprintln!("usage: artist-bio <artist> [<artist> ...]");
        return Ok(());
    }

    let config = load_config();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let scheduler = Arc::new(TokioScheduler::new(runtime.handle().clone()));
    let batcher = wikipedia_artist_batcher(&config, scheduler);
    let options = batcher.options();
    info!(
        "Looking up {} artists via {} (lang={}, flush_delay={:?}, chunk={})",
        artists.len(),
        batcher.source().endpoint(),
        config.endpoint.lang,
        options.flush_delay,
        options.prefetch_chunk_size
    );

    batcher.prefetch_missing(&artists);
    runtime.block_on(async {
        for artist in &artists {
            let bio = batcher.queue(artist).await;
            let text = if bio.bio.trim().is_empty() {
                "Biography not found."
            } else {
                bio.bio.trim()
            };
            println!("{} [{:?}]\n  {}", bio.title, bio.status, text);
            if !bio.source_url.is_empty() {
                println!("  {}", bio.source_url);
            }
        }
    });
    Ok(())
}
