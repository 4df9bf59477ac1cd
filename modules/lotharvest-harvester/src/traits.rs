// Trait seams for the external collaborators and for session supply.
//
// The harvesting core never persists, translates, or stores images
// itself; it hands records across these boundaries. Mocks in `testing`
// implement the same traits, so orchestrator tests run with no network,
// no browser, no database.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lotharvest_common::{HarvestError, ItemRecord};

use crate::transport::PageTransport;

/// Supplies authenticated transports: one listing session plus an indexed
/// detail pool. Implementations own login lifecycles and TTLs.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Transport for listing pages, logged in. A `Session` error here
    /// aborts the site's run.
    async fn listing_transport(&self) -> Result<Arc<dyn PageTransport>, HarvestError>;

    /// Transport for one detail-pool slot, relogging the whole pool in
    /// first when its group TTL has lapsed. Concurrent fetches against the
    /// same slot must be serialized by the caller.
    async fn detail_transport(&self, slot: usize) -> Result<Arc<dyn PageTransport>, HarvestError>;

    /// Drop the listing session. The detail pool stays warm under its own
    /// TTL for on-demand fetches.
    async fn close_listing(&self);
}

/// Source-language text in, target-language text out. Invoked during
/// normalization for sites that list without English titles.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> Result<String>;
}

/// Downloads/resizes the image URLs on freshly harvested records and
/// rewrites the fields in place to local paths, in bounded batches.
#[async_trait]
pub trait ImageIngest: Send + Sync {
    async fn ingest_batch(&self, records: &mut [ItemRecord]) -> Result<()>;
}

/// Persistence collaborator: supplies the dedup id set and receives the
/// finalized batch. Deletion is its concern alone.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn existing_ids(&self, site_id: &str) -> Result<HashSet<String>>;

    async fn upsert_batch(
        &self,
        site_id: &str,
        items: &[lotharvest_common::HarvestedItem],
    ) -> Result<()>;

    async fn apply_updates(
        &self,
        site_id: &str,
        updates: &[lotharvest_common::PriceUpdate],
    ) -> Result<()>;
}
