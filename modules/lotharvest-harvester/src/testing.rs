// Test doubles for the harvesting pipeline.
//
// MOCK → FUNCTION → OUTPUT: register pages on a MockTransport, run the
// orchestrator (or a single component), assert on what came out. No
// network, no browser, no persistence.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lotharvest_common::{BidMode, Category, HarvestError};

use crate::limiter::ConcurrencyLimits;
use crate::profiles::{ExtractionKind, ListingSelectors, LoginProfile, SiteProfile, TransportKind};
use crate::traits::{SessionProvider, Translator};
use crate::transport::PageTransport;

// ---------------------------------------------------------------------------
// Test site profile
// ---------------------------------------------------------------------------

fn test_query(category_id: &str, page: u32) -> String {
    format!("?category={category_id}&page={page}")
}

fn test_detail(item_id: &str) -> String {
    format!("https://test.example.com/item/{item_id}")
}

pub static TEST_SITE: SiteProfile = SiteProfile {
    site_id: "testsite",
    credential_key: "TESTSITE",
    base_url: "https://test.example.com",
    login: LoginProfile::Form {
        page_url: "https://test.example.com/sign-in",
        post_url: "https://test.example.com/post-sign-in",
        check_urls: &["https://test.example.com/account"],
        user_field: "email",
        password_field: "password",
        extra_fields: &[],
        csrf_selector: None,
        seed_cookies: &[],
    },
    search_url: "https://test.example.com/items",
    search_query: test_query,
    detail_url: test_detail,
    category_ids: &["1"],
    categories: &[("1", Category::Watch)],
    listing: ListingSelectors {
        item_container: ".lot",
        pagination_last: ".pager .last a",
        fields: &[
            ("id", "a.lot-link@data-id"),
            ("title", "a.lot-link"),
            ("starting_price", ".price"),
            ("current_price", ".current"),
            ("image", "img.thumb@src"),
            ("scheduled_date", ".sched"),
            ("status", ".status"),
        ],
    },
    detail_fields: &[
        ("images", ".item-thumbnail@style"),
        ("description", ".desc"),
    ],
    strategy: ExtractionKind::Dom,
    transport: TransportKind::Http,
    use_proxies: false,
    limits: ConcurrencyLimits {
        pages: 5,
        probes: 20,
        details: 2,
    },
    page_attempts: 2,
    retry_delay_ms: 0,
    page_timeout_secs: 5,
    session_ttl_secs: 3 * 3600,
    detail_pool_size: 2,
    page_size: 50,
    bid_mode: BidMode::AuctionFloor,
    closed_markers: &["sold out"],
    no_collection_weekdays: &[],
    translate_titles: true,
};

// ---------------------------------------------------------------------------
// Fixture HTML
// ---------------------------------------------------------------------------

/// One listing row for fixture pages. Placeholder rows carry an id and
/// nothing else, the shape listings serve past real inventory.
#[derive(Debug, Clone, Default)]
pub struct FixtureItem {
    pub id: String,
    pub title: Option<String>,
    pub price: Option<String>,
    pub current: Option<String>,
    pub scheduled: Option<String>,
    pub status: Option<String>,
}

impl FixtureItem {
    pub fn new(id: &str, title: &str, price: &str) -> Self {
        Self {
            id: id.to_string(),
            title: Some(title.to_string()),
            price: Some(price.to_string()),
            ..Self::default()
        }
    }

    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_current(mut self, current: &str) -> Self {
        self.current = Some(current.to_string());
        self
    }

    pub fn with_scheduled(mut self, scheduled: &str) -> Self {
        self.scheduled = Some(scheduled.to_string());
        self
    }

    fn html(&self) -> String {
        let mut out = format!(
            r#"<div class="lot"><a class="lot-link" data-id="{}">{}</a>"#,
            self.id,
            self.title.as_deref().unwrap_or("")
        );
        if let Some(price) = &self.price {
            out.push_str(&format!(r#"<span class="price">{price}</span>"#));
        }
        if let Some(current) = &self.current {
            out.push_str(&format!(r#"<span class="current">{current}</span>"#));
        }
        if let Some(scheduled) = &self.scheduled {
            out.push_str(&format!(r#"<span class="sched">{scheduled}</span>"#));
        }
        if let Some(status) = &self.status {
            out.push_str(&format!(r#"<span class="status">{status}</span>"#));
        }
        out.push_str("</div>");
        out
    }
}

/// Build a listing page in the test site's shape, optionally with a
/// last-page pagination link.
pub fn listing_page(items: &[FixtureItem], last_link: Option<&str>) -> String {
    let rows: String = items.iter().map(FixtureItem::html).collect();
    let pager = match last_link {
        Some(href) => {
            format!(r#"<div class="pager"><ul><li class="last"><a href="{href}">Last</a></li></ul></div>"#)
        }
        None => String::new(),
    };
    format!("<html><body><div class=\"grid\">{rows}</div>{pager}</body></html>")
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// HashMap-backed transport. Unregistered URLs fail like a dead page, and
/// every fetch is recorded so tests can assert what was (not) requested.
#[derive(Default)]
pub struct MockTransport {
    pages: HashMap<String, String>,
    fetched: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page(mut self, url: &str, html: impl Into<String>) -> Self {
        self.pages.insert(url.to_string(), html.into());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().expect("fetched log poisoned").clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetched().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl PageTransport for MockTransport {
    async fn fetch(&self, url: &str) -> Result<String, HarvestError> {
        self.fetched
            .lock()
            .expect("fetched log poisoned")
            .push(url.to_string());
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| HarvestError::Transport(format!("MockTransport: no page for {url}")))
    }

    async fn submit_form(
        &self,
        url: &str,
        _fields: &[(String, String)],
    ) -> Result<String, HarvestError> {
        self.fetch(url).await
    }
}

// ---------------------------------------------------------------------------
// MockSessionProvider
// ---------------------------------------------------------------------------

/// Hands out one shared transport for listing and details.
pub struct MockSessionProvider {
    transport: Arc<MockTransport>,
    listing_closed: AtomicBool,
}

impl MockSessionProvider {
    pub fn new(transport: Arc<MockTransport>) -> Self {
        Self {
            transport,
            listing_closed: AtomicBool::new(false),
        }
    }

    pub fn listing_closed(&self) -> bool {
        self.listing_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for MockSessionProvider {
    async fn listing_transport(&self) -> Result<Arc<dyn PageTransport>, HarvestError> {
        Ok(self.transport.clone())
    }

    async fn detail_transport(
        &self,
        _slot: usize,
    ) -> Result<Arc<dyn PageTransport>, HarvestError> {
        Ok(self.transport.clone())
    }

    async fn close_listing(&self) {
        self.listing_closed.store(true, Ordering::SeqCst);
    }
}

/// Session provider whose login always fails; drives the abort path.
pub struct FailingSessionProvider;

#[async_trait]
impl SessionProvider for FailingSessionProvider {
    async fn listing_transport(&self) -> Result<Arc<dyn PageTransport>, HarvestError> {
        Err(HarvestError::session("testsite", "login exhausted retries"))
    }

    async fn detail_transport(
        &self,
        _slot: usize,
    ) -> Result<Arc<dyn PageTransport>, HarvestError> {
        Err(HarvestError::session("testsite", "login exhausted retries"))
    }

    async fn close_listing(&self) {}
}

// ---------------------------------------------------------------------------
// MockTranslator
// ---------------------------------------------------------------------------

/// Deterministic translator: prefixes text and counts invocations.
#[derive(Default)]
pub struct MockTranslator {
    calls: AtomicU32,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(&self, text: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("[en] {text}"))
    }
}

/// Convenience: ids "1"..="n" as an existing-id set.
pub fn existing_ids(range: std::ops::RangeInclusive<u32>) -> HashSet<String> {
    range.map(|i| i.to_string()).collect()
}
