//! Buffer cell demo
//!
//! Registers a "cfg" buffer whose reload is slow, then lets several threads
//! load it at once, modify it, and clear it. Run with `RUST_LOG=debug` to see
//! every claim, wait and release.
//!
//! Usage: `buffcell_demo [config.json]`

use buffcell::{BufferRegistry, RegistryConfig};
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const LOADER_THREADS: usize = 4;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => RegistryConfig::from_json_reader(File::open(path)?)?,
        None => RegistryConfig::default(),
    };
    info!(?config, "starting");

    let reloads = Arc::new(AtomicUsize::new(0));
    let reloads_clone = Arc::clone(&reloads);

    let mut registry = BufferRegistry::with_config(config);
    registry.register("cfg", 0_i64, move |x: &i64| {
        reloads_clone.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        x + 1
    })?;

    let cfg = registry.get::<i64>("cfg")?;

    // Concurrent first load: one thread reloads, the others wait for it
    let values = thread::scope(|s| {
        let workers: Vec<_> = (0..LOADER_THREADS)
            .map(|_| {
                let cfg = cfg.clone();
                s.spawn(move || cfg.load())
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().map_err(|_| "loader thread panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;
    for value in values {
        let value = value?;
        info!(value, "loaded by thread");
    }
    info!(reloads = reloads.load(Ordering::SeqCst), "after concurrent load");

    cfg.modify(100);
    let value = cfg.load()?;
    info!(value, "after modify");

    cfg.clear();
    let value = cfg.load()?;
    info!(value, "after clear");

    info!(
        reloads = reloads.load(Ordering::SeqCst),
        last_modified = %cfg.last_modified(),
        "done"
    );
    Ok(())
}
