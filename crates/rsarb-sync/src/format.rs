//! Store-backed reply formatting.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rsarb_core::render_reply;
use rsarb_storage::{Store, StoreError};
use thiserror::Error;

/// A matched title has no catalog entry. The scanner only yields titles read
/// from the catalog, so this means the catalog changed under a running cycle.
#[derive(Debug, Error)]
#[error("catalog has no entry for matched title {title:?}")]
pub struct CatalogMiss {
    pub title: String,
}

/// One block per title, in the set's (sorted) order.
pub async fn format_reply(
    store: &Store,
    titles: &BTreeSet<String>,
    bot_identity: &str,
    feedback_subreddit: &str,
) -> Result<String> {
    let mut entries = Vec::with_capacity(titles.len());
    for title in titles {
        match store.lookup_catalog_entry(title).await {
            Ok(entry) => entries.push(entry),
            Err(StoreError::NotFound(_)) => return Err(CatalogMiss { title: title.clone() }.into()),
            Err(err) => return Err(err).with_context(|| format!("looking up catalog entry {title:?}")),
        }
    }
    Ok(render_reply(&entries, bot_identity, feedback_subreddit))
}
