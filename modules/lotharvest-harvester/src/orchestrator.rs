use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use lotharvest_common::{HarvestError, HarvestedItem, ItemRecord, PriceUpdate};
use serde_json::Map;
use tracing::{debug, info, warn};

use crate::dedup;
use crate::extract::{strategy_for, ExtractionStrategy, RawItem};
use crate::limiter::{Scheduler, POOL_DETAILS, POOL_PAGES, POOL_PROBES};
use crate::normalize::{self, Normalizer};
use crate::pagination::PaginationDiscoverer;
use crate::profiles::SiteProfile;
use crate::retry::RetryPolicy;
use crate::stats::HarvestStats;
use crate::traits::{SessionProvider, Translator};
use crate::transport::PageTransport;

/// Where a run currently is; logged as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    LoggingIn,
    DiscoveringPages,
    CrawlingPage,
    Aggregating,
    Closed,
    Aborted,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::LoggingIn => "logging-in",
            RunState::DiscoveringPages => "discovering-pages",
            RunState::CrawlingPage => "crawling-page",
            RunState::Aggregating => "aggregating",
            RunState::Closed => "closed",
            RunState::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// Everything one bulk run produced: records and stubs in listing order,
/// plus the run's accumulated counters.
pub struct HarvestOutcome {
    pub items: Vec<HarvestedItem>,
    pub stats: HarvestStats,
}

/// Detail-page fields for one lot, fetched on demand outside bulk runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDetails {
    pub item_id: String,
    pub additional_images: Vec<String>,
    pub fields: Map<String, serde_json::Value>,
}

struct PageOutcome {
    items: Vec<HarvestedItem>,
    exhausted: bool,
}

/// Per-site driver composing sessions, pagination, extraction,
/// normalization, dedup and bounded fan-out. One orchestrator runs one
/// site sequentially; parallelism lives inside the page and item levels.
pub struct CrawlOrchestrator {
    profile: &'static SiteProfile,
    sessions: Arc<dyn SessionProvider>,
    strategy: Box<dyn ExtractionStrategy>,
    normalizer: Normalizer,
    pager: PaginationDiscoverer,
    scheduler: Scheduler,
    translator: Option<Arc<dyn Translator>>,
    page_retry: RetryPolicy,
    detail_retry: RetryPolicy,
}

impl CrawlOrchestrator {
    pub fn new(
        profile: &'static SiteProfile,
        sessions: Arc<dyn SessionProvider>,
        translator: Option<Arc<dyn Translator>>,
    ) -> Self {
        Self {
            profile,
            sessions,
            strategy: strategy_for(profile),
            normalizer: Normalizer::new(profile),
            pager: PaginationDiscoverer::new(profile),
            scheduler: Scheduler::new(profile.limits),
            translator,
            page_retry: RetryPolicy::new(profile.page_attempts, profile.retry_delay()),
            // Detail fetches are expensive; no retry.
            detail_retry: RetryPolicy::once(),
        }
    }

    fn enter(&self, state: RunState) {
        debug!(site = self.profile.site_id, state = %state, "Run state");
    }

    /// Crawl every category of the site. Only session establishment aborts
    /// the run; category- and page-level failures are logged and skipped.
    /// Zero items is an empty-but-successful result.
    pub async fn harvest(
        &self,
        existing_ids: &HashSet<String>,
    ) -> Result<HarvestOutcome, HarvestError> {
        let started = Instant::now();
        let mut stats = HarvestStats::default();
        let mut items = Vec::new();

        self.enter(RunState::LoggingIn);
        let transport = match self.sessions.listing_transport().await {
            Ok(transport) => transport,
            Err(err) => {
                self.enter(RunState::Aborted);
                return Err(err);
            }
        };

        for category_id in self.profile.category_ids.iter().copied() {
            self.enter(RunState::DiscoveringPages);
            let total_pages = self
                .pager
                .discover(&*transport, &*self.strategy, category_id)
                .await;
            info!(
                site = self.profile.site_id,
                category = category_id,
                pages = total_pages,
                "Category measured"
            );

            let mut category_items = 0usize;
            for page in 1..=total_pages {
                self.enter(RunState::CrawlingPage);
                let url = self.profile.listing_url(category_id, page);
                let Some(html) = self.fetch_page(&*transport, &url).await else {
                    stats.pages_failed += 1;
                    continue;
                };
                stats.pages_fetched += 1;

                let outcome = self
                    .process_page(&html, category_id, existing_ids, &mut stats)
                    .await;
                category_items += outcome.items.len();
                items.extend(outcome.items);

                if outcome.exhausted {
                    stats.exhaustion_stops += 1;
                    info!(
                        site = self.profile.site_id,
                        category = category_id,
                        page,
                        "Placeholder rows reached; stopping category early"
                    );
                    break;
                }
            }

            stats.categories_crawled += 1;
            info!(
                site = self.profile.site_id,
                category = category_id,
                items = category_items,
                "Category complete"
            );
        }

        self.enter(RunState::Aggregating);
        self.sessions.close_listing().await;
        stats.elapsed = started.elapsed();
        self.enter(RunState::Closed);
        info!(
            site = self.profile.site_id,
            items = items.len(),
            "Harvest complete"
        );

        Ok(HarvestOutcome { items, stats })
    }

    /// Lightweight pass that re-reads listing pages and emits price/date
    /// deltas for already-known lots; nothing is re-extracted in full.
    pub async fn harvest_updates(
        &self,
        existing_ids: &HashSet<String>,
    ) -> Result<Vec<PriceUpdate>, HarvestError> {
        self.enter(RunState::LoggingIn);
        let transport = self.sessions.listing_transport().await?;
        let mut updates = Vec::new();

        for category_id in self.profile.category_ids.iter().copied() {
            let total_pages = self
                .pager
                .discover(&*transport, &*self.strategy, category_id)
                .await;

            // Update pages carry no dedup state, so their fetches fan out
            // under the page pool; processing stays in page order.
            let urls: Vec<String> = (1..=total_pages)
                .map(|page| self.profile.listing_url(category_id, page))
                .collect();
            let pages = self
                .scheduler
                .bounded(
                    POOL_PAGES,
                    urls.iter()
                        .map(|url| self.fetch_page(&*transport, url))
                        .collect(),
                )
                .await;

            'pages: for html in pages.into_iter().flatten() {
                for handle in self.strategy.handles(&html) {
                    let Some(raw) = self.strategy.extract(&handle) else {
                        continue;
                    };
                    if dedup::is_placeholder(&raw) {
                        break 'pages;
                    }
                    let Some(item_id) = raw.get("id").map(normalize::id_from_handle) else {
                        continue;
                    };
                    if !existing_ids.contains(&item_id) {
                        continue;
                    }
                    updates.push(PriceUpdate {
                        item_id,
                        site_id: self.profile.site_id.to_string(),
                        current_price: raw
                            .get("current_price")
                            .and_then(|v| normalize::currency_to_int(v).ok()),
                        scheduled_date: raw
                            .get("scheduled_date")
                            .and_then(normalize::parse_scheduled),
                    });
                }
            }
        }

        self.sessions.close_listing().await;
        info!(
            site = self.profile.site_id,
            updates = updates.len(),
            "Update pass complete"
        );
        Ok(updates)
    }

    /// On-demand single-item fetch through one detail-pool slot. The pool
    /// stays warm between calls under its own TTL. Concurrent calls
    /// against the same slot must be serialized by the caller.
    pub async fn fetch_item_details(
        &self,
        item_id: &str,
        slot: usize,
    ) -> Result<Option<ItemDetails>, HarvestError> {
        let transport = self.sessions.detail_transport(slot).await?;
        let url = (self.profile.detail_url)(item_id);

        // Concurrent on-demand fetches share the (narrow) detail pool.
        let Some(html) = self
            .scheduler
            .run(POOL_DETAILS, self.detail_retry.run("detail fetch", || {
                let transport = transport.clone();
                let url = url.clone();
                async move { transport.fetch(&url).await }
            }))
            .await
        else {
            return Ok(None);
        };

        Ok(Some(extract_details(
            item_id,
            &html,
            self.profile.detail_fields,
        )))
    }

    async fn fetch_page(&self, transport: &dyn PageTransport, url: &str) -> Option<String> {
        let timeout = self.profile.page_timeout();
        self.page_retry
            .run("page fetch", || async move {
                match tokio::time::timeout(timeout, transport.fetch(url)).await {
                    Ok(result) => result,
                    Err(_) => Err(HarvestError::Transport(format!(
                        "{url} timed out after {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await
    }

    async fn process_page(
        &self,
        html: &str,
        category_id: &str,
        existing_ids: &HashSet<String>,
        stats: &mut HarvestStats,
    ) -> PageOutcome {
        let handles = self.strategy.handles(html);
        if handles.is_empty() {
            return PageOutcome {
                items: Vec::new(),
                exhausted: false,
            };
        }

        // Cheap id/status probes fan out wide; results stay in handle
        // order.
        let strategy = &self.strategy;
        let probes = self
            .scheduler
            .bounded(
                POOL_PROBES,
                handles
                    .iter()
                    .map(|handle| async move { strategy.probe(handle) })
                    .collect(),
            )
            .await;

        let partition = dedup::partition(&probes, existing_ids, self.profile);
        stats.closed_skipped += partition.closed;
        stats.collection_day_skipped += partition.skipped_collection_day;

        let mut items = Vec::new();
        let mut exhausted = false;

        // Both index lists are in handle order; merge them back so the
        // page's output preserves listing order.
        let mut stub_iter = partition.stubs.iter().peekable();
        let mut process_iter = partition.process.iter().peekable();

        for index in 0..probes.len() {
            if stub_iter.peek().map(|(i, _)| *i) == Some(index) {
                let (_, item_id) = stub_iter.next().expect("peeked stub");
                stats.stubs_emitted += 1;
                items.push(HarvestedItem::Stub {
                    item_id: item_id.clone(),
                });
            } else if process_iter.peek() == Some(&&index) {
                process_iter.next();
                let Some(raw) = self.strategy.extract(&handles[index]) else {
                    warn!(
                        site = self.profile.site_id,
                        category = category_id,
                        "Malformed handle skipped"
                    );
                    continue;
                };
                if dedup::is_placeholder(&raw) {
                    exhausted = true;
                    continue;
                }
                match self.normalize_item(&raw, category_id, stats).await {
                    Some(record) => {
                        stats.items_extracted += 1;
                        items.push(HarvestedItem::Record(Box::new(record)));
                    }
                    None => stats.dropped_invalid += 1,
                }
            }
        }

        PageOutcome { items, exhausted }
    }

    async fn normalize_item(
        &self,
        raw: &RawItem,
        category_id: &str,
        stats: &mut HarvestStats,
    ) -> Option<ItemRecord> {
        let mut record = match self.normalizer.normalize(raw, category_id) {
            Ok(record) => record,
            Err(err) => {
                debug!(site = self.profile.site_id, error = %err, "Item dropped");
                return None;
            }
        };

        if self.profile.translate_titles {
            if let Some(translator) = &self.translator {
                stats.translation_calls += 1;
                match translator.translate(&record.original_title).await {
                    Ok(translated) => record.translated_title = Some(translated),
                    Err(err) => {
                        warn!(
                            site = self.profile.site_id,
                            item = record.item_id.as_str(),
                            error = %err,
                            "Translation failed; record keeps source title only"
                        );
                    }
                }
            }
        }

        Some(record)
    }
}

/// Run the detail field map over a detail page. The plural `images` field
/// collects every match; `url(...)` style values are unwrapped to bare
/// URLs.
fn extract_details(
    item_id: &str,
    html: &str,
    fields: &'static [(&'static str, &'static str)],
) -> ItemDetails {
    use scraper::{Html, Selector};

    let document = Html::parse_document(html);
    let mut details = ItemDetails {
        item_id: item_id.to_string(),
        additional_images: Vec::new(),
        fields: Map::new(),
    };

    for (name, raw_selector) in fields {
        let (css, attr) = match raw_selector.rsplit_once('@') {
            Some((css, attr)) if !attr.contains(']') => (css, Some(attr)),
            _ => (*raw_selector, None),
        };
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };

        if *name == "images" {
            details.additional_images = document
                .select(&selector)
                .filter_map(|el| match attr {
                    Some(attr) => el.value().attr(attr).map(str::to_string),
                    None => Some(el.text().collect::<String>().trim().to_string()),
                })
                .filter_map(|value| unwrap_css_url(&value))
                .collect();
            continue;
        }

        if let Some(element) = document.select(&selector).next() {
            let value = match attr {
                Some(attr) => element.value().attr(attr).unwrap_or_default().to_string(),
                None => element.text().collect::<String>().trim().to_string(),
            };
            if !value.is_empty() {
                details.fields.insert(name.to_string(), value.into());
            }
        }
    }

    details
}

/// Thumbnails often arrive as inline styles; pull the URL out of
/// `url(...)` and drop any query string. Plain URLs pass through.
fn unwrap_css_url(value: &str) -> Option<String> {
    let cleaned = value.replace(['\'', '"'], "");
    let url = match cleaned.find("url(") {
        Some(start) => {
            let rest = &cleaned[start + 4..];
            rest[..rest.find(')')?].trim().to_string()
        }
        None => cleaned.trim().to_string(),
    };
    let url = url.split('?').next().unwrap_or(&url).trim().to_string();
    (!url.is_empty()).then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_style_urls_and_strips_queries() {
        assert_eq!(
            unwrap_css_url("background-image: url('https://cdn.test/a.jpg?w=80')").as_deref(),
            Some("https://cdn.test/a.jpg")
        );
        assert_eq!(
            unwrap_css_url("https://cdn.test/b.jpg").as_deref(),
            Some("https://cdn.test/b.jpg")
        );
        assert_eq!(unwrap_css_url("url()"), None);
    }
}
