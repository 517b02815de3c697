//! Shared utility functions.

use std::sync::LazyLock;

use regex::Regex;
use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run blocking work (git2, std::process) off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

static REF_UNSAFE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

/// Reduce an arbitrary id to a git-ref-safe path component.
pub fn sanitize_ref_component(raw: &str) -> String {
    let cleaned = REF_UNSAFE_RE.replace_all(raw.trim(), "-");
    let cleaned = cleaned.trim_matches(|c: char| c == '-' || c == '.');
    let cleaned = cleaned.replace("..", ".");
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}
