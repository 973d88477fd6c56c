//! Host whitelist file.
//!
//! One hostname per line; blank lines and `#` comments are ignored. The file
//! is re-read on an interval and changes are pushed to the allocator. A read
//! failure keeps the previous whitelist.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::actors::AllocatorHandle;
use crate::clock;

#[derive(Debug, Error)]
pub enum WhitelistError {
    #[error("failed to read whitelist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts plain paths and `file://` URLs.
pub fn whitelist_path(raw: &Path) -> PathBuf {
    match raw.to_str().and_then(|s| s.strip_prefix("file://")) {
        Some(stripped) => PathBuf::from(stripped),
        None => raw.to_path_buf(),
    }
}

pub fn parse_whitelist(text: &str) -> HashSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub async fn load_whitelist(path: &Path) -> Result<HashSet<String>, WhitelistError> {
    let path = whitelist_path(path);
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| WhitelistError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(parse_whitelist(&text))
}

/// Re-read the whitelist every `refresh` until shutdown.
#[instrument(skip(allocator, current, shutdown), fields(path = %path.display()))]
pub async fn run_whitelist_loop(
    path: PathBuf,
    refresh: Duration,
    allocator: AllocatorHandle,
    mut current: HashSet<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(hosts = current.len(), refresh_ms = refresh.as_millis() as u64, "Watching whitelist");
    let mut timer = tokio::time::interval_at(clock::now() + refresh, refresh);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match load_whitelist(&path).await {
                    Ok(hosts) if hosts != current => {
                        info!(hosts = hosts.len(), "Whitelist changed");
                        allocator.update_whitelist(Some(hosts.clone()));
                        current = hosts;
                    }
                    Ok(_) => debug!("Whitelist unchanged"),
                    Err(e) => warn!(error = %e, "Keeping previous whitelist"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Whitelist loop shutting down");
                    break;
                }
            }
        }
    }
}
