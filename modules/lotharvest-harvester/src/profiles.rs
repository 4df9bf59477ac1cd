use std::time::Duration;

use chrono::Weekday;
use lotharvest_common::{BidMode, Category};

use crate::limiter::ConcurrencyLimits;

/// Which transport drives listing/detail sessions for a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Headless-Chromium session; needed where listings are assembled by
    /// scripts or logins run through interactive forms.
    Rendered,
    /// Plain cookie-jar HTTP session.
    Http,
}

/// How item fields come out of a listing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionKind {
    /// CSS field-map queries against item containers.
    Dom,
    /// A `window.<var> = …` script payload embedded in the page.
    EmbeddedScript { var: &'static str },
}

/// Per-site login shape.
#[derive(Debug, Clone, Copy)]
pub enum LoginProfile {
    /// Credential form POSTed over HTTP, optionally with a CSRF token
    /// scraped from the login page first.
    Form {
        page_url: &'static str,
        post_url: &'static str,
        /// All must answer 200 for the session to count as live.
        check_urls: &'static [&'static str],
        user_field: &'static str,
        password_field: &'static str,
        extra_fields: &'static [(&'static str, &'static str)],
        /// (hidden-input selector, posted field name) for CSRF tokens.
        csrf_selector: Option<(&'static str, &'static str)>,
        /// Preference cookies some sites expect before the first listing
        /// request (page size, language).
        seed_cookies: &'static [&'static str],
    },
    /// Interactive form filled in a rendering session.
    Rendered {
        page_url: &'static str,
        user_selector: &'static str,
        password_selector: &'static str,
        submit_selector: &'static str,
        /// Post-login popup/banner to dismiss when present.
        interstitial_selector: Option<&'static str>,
    },
}

impl LoginProfile {
    pub fn page_url(&self) -> &'static str {
        match self {
            LoginProfile::Form { page_url, .. } => page_url,
            LoginProfile::Rendered { page_url, .. } => page_url,
        }
    }
}

/// Listing-page selector map. Field selectors may end in `@attr` to pull
/// an attribute instead of text content.
#[derive(Debug, Clone, Copy)]
pub struct ListingSelectors {
    pub item_container: &'static str,
    pub pagination_last: &'static str,
    pub fields: &'static [(&'static str, &'static str)],
}

/// Immutable declarative configuration for one auction property.
pub struct SiteProfile {
    pub site_id: &'static str,
    pub credential_key: &'static str,
    pub base_url: &'static str,
    pub login: LoginProfile,
    pub search_url: &'static str,
    pub search_query: fn(category_id: &str, page: u32) -> String,
    pub detail_url: fn(item_id: &str) -> String,
    pub category_ids: &'static [&'static str],
    pub categories: &'static [(&'static str, Category)],
    pub listing: ListingSelectors,
    pub detail_fields: &'static [(&'static str, &'static str)],
    pub strategy: ExtractionKind,
    pub transport: TransportKind,
    pub use_proxies: bool,
    pub limits: ConcurrencyLimits,
    pub page_attempts: u32,
    pub retry_delay_ms: u64,
    pub page_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub detail_pool_size: usize,
    /// Items per listing page; used when pagination metadata reports a
    /// total item count instead of a page count.
    pub page_size: u32,
    pub bid_mode: BidMode,
    /// Free-text status labels marking a lot as sold/closed. Matched
    /// case-insensitively after full-width folding. Known fragility: no
    /// site exposes a structured status code.
    pub closed_markers: &'static [&'static str],
    /// Weekdays whose lots are skipped because no collection runs then.
    pub no_collection_weekdays: &'static [Weekday],
    pub translate_titles: bool,
}

impl SiteProfile {
    pub fn category_label(&self, code: &str) -> Category {
        self.categories
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, label)| *label)
            .unwrap_or(Category::Other)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn listing_url(&self, category_id: &str, page: u32) -> String {
        format!("{}{}", self.search_url, (self.search_query)(category_id, page))
    }
}

pub fn all() -> &'static [&'static SiteProfile] {
    &[&VERDE, &STELLAR, &PELICAN]
}

pub fn by_id(site_id: &str) -> Option<&'static SiteProfile> {
    all().iter().copied().find(|p| p.site_id == site_id)
}

// ---------------------------------------------------------------------------
// Verde Auction — HTTP, CSRF form login, DOM grid listings
// ---------------------------------------------------------------------------

fn verde_query(category_id: &str, page: u32) -> String {
    format!("?limit=200&sortKey=1&tableType=grid&master_item_categories[0]={category_id}&page={page}")
}

fn verde_detail(item_id: &str) -> String {
    format!("https://www.verde-auction.com/client/auction-items/view/{item_id}")
}

pub static VERDE: SiteProfile = SiteProfile {
    site_id: "verde",
    credential_key: "VERDE",
    base_url: "https://www.verde-auction.com",
    login: LoginProfile::Form {
        page_url: "https://www.verde-auction.com/client/users/sign-in",
        post_url: "https://www.verde-auction.com/client/users/post-sign-in",
        check_urls: &["https://www.verde-auction.com/client/users"],
        user_field: "email_address",
        password_field: "password",
        extra_fields: &[],
        csrf_selector: Some((r#"input[name="_csrfToken"]"#, "_csrfToken")),
        seed_cookies: &[],
    },
    search_url: "https://www.verde-auction.com/client/auctions/inspect",
    search_query: verde_query,
    detail_url: verde_detail,
    category_ids: &["1", "2", "3", "4", "5", "8", "9", "27"],
    categories: &[
        ("1", Category::Watch),
        ("2", Category::Bag),
        ("3", Category::Jewelry),
        ("4", Category::Accessory),
        ("5", Category::Goods),
        ("8", Category::Clothing),
        ("9", Category::Shoes),
        ("27", Category::Other),
    ],
    listing: ListingSelectors {
        item_container: ".col-sm-6.col-md-4.col-lg-3.mb-grid-card",
        pagination_last: ".pagination .last a",
        fields: &[
            ("id", "[data-auction-item-id]@data-auction-item-id"),
            ("title", ".card b"),
            ("brand", "small.show-case-brand"),
            ("rank", ".canopy.canopy-3 li:nth-child(1)"),
            ("starting_price", ".canopy.canopy-3 li:nth-child(2) big"),
            ("image", ".pc-image-area img@src"),
            ("scheduled_date", "span.market-title"),
            ("status", ".show-case-state"),
        ],
    },
    detail_fields: &[
        ("images", ".item-thumbnail@style"),
        ("description", ".item-info.view-form"),
        ("accessory_code", ".dl-horizontal dd:nth-of-type(7)"),
    ],
    strategy: ExtractionKind::Dom,
    transport: TransportKind::Http,
    use_proxies: false,
    limits: ConcurrencyLimits {
        pages: 5,
        probes: 20,
        details: 2,
    },
    page_attempts: 3,
    retry_delay_ms: 1_000,
    page_timeout_secs: 60,
    session_ttl_secs: 3 * 3600,
    detail_pool_size: 2,
    page_size: 200,
    bid_mode: BidMode::AuctionFloor,
    closed_markers: &["sold", "closed", "終了"],
    no_collection_weekdays: &[Weekday::Tue, Weekday::Thu],
    translate_titles: false,
};

// ---------------------------------------------------------------------------
// Stellar Global — rendered sessions, DOM table listings
// ---------------------------------------------------------------------------

fn stellar_query(category_id: &str, page: u32) -> String {
    format!("?sub_categories%5B0%5D={category_id}&limit=100&page={page}")
}

fn stellar_detail(item_id: &str) -> String {
    format!("https://www.stellar-global-auction.com/item/{item_id}")
}

pub static STELLAR: SiteProfile = SiteProfile {
    site_id: "stellar",
    credential_key: "STELLAR",
    base_url: "https://www.stellar-global-auction.com",
    login: LoginProfile::Rendered {
        page_url: "https://www.stellar-global-auction.com/login",
        user_selector: "#email",
        password_selector: "#password",
        submit_selector: r#"button[type="submit"]"#,
        interstitial_selector: Some(".common_btn.vivid"),
    },
    search_url: "https://www.stellar-global-auction.com/item",
    search_query: stellar_query,
    detail_url: stellar_detail,
    category_ids: &["1", "2", "3", "5", "6", "7", "8"],
    categories: &[
        ("1", Category::Watch),
        ("2", Category::Jewelry),
        ("3", Category::Jewelry),
        ("5", Category::Bag),
        ("6", Category::Accessory),
        ("7", Category::Clothing),
        ("8", Category::Shoes),
    ],
    listing: ListingSelectors {
        item_container: ".p-item-list__body",
        pagination_last: ".p-pagination__item:nth-last-child(2) a",
        fields: &[
            ("id", "a[href]@href"),
            ("title", ".p-text-link"),
            ("rank", ".rank .icon"),
            ("starting_price", "tbody tr:nth-child(1) td:nth-child(2)"),
            ("image", ".p-item-list__body__cell.-image img@src"),
            ("scheduled_date", ".ended-at"),
            ("status", ".item-state"),
        ],
    },
    detail_fields: &[
        ("images", ".p-item-image__thumb__item img@src"),
        ("brand", ".p-def-list__desc:nth-of-type(1)"),
        ("lot_no", ".p-def-list__desc:nth-of-type(2)"),
        ("notes", ".p-def-list"),
    ],
    strategy: ExtractionKind::Dom,
    transport: TransportKind::Rendered,
    use_proxies: false,
    limits: ConcurrencyLimits {
        pages: 3,
        probes: 10,
        details: 2,
    },
    page_attempts: 3,
    retry_delay_ms: 1_000,
    page_timeout_secs: 60,
    session_ttl_secs: 3 * 3600,
    detail_pool_size: 2,
    page_size: 100,
    bid_mode: BidMode::AuctionFloor,
    closed_markers: &["ended", "sold out"],
    no_collection_weekdays: &[],
    translate_titles: false,
};

// ---------------------------------------------------------------------------
// Pelican Trade — HTTP behind the proxy pool, script-payload listings
// ---------------------------------------------------------------------------

fn pelican_query(category_id: &str, page: u32) -> String {
    let mut query = format!("?category={category_id}&word=&bid=0&my_bid=0");
    if page > 1 {
        query.push_str(&format!("&page={page}"));
    }
    query
}

fn pelican_detail(item_id: &str) -> String {
    format!("https://pelican-trade.jp/product/detail/{item_id}/")
}

pub static PELICAN: SiteProfile = SiteProfile {
    site_id: "pelican",
    credential_key: "PELICAN",
    base_url: "https://pelican-trade.jp",
    login: LoginProfile::Form {
        page_url: "https://pelican-trade.jp/login/",
        post_url: "https://pelican-trade.jp/login/",
        check_urls: &["https://pelican-trade.jp/auction/"],
        user_field: "mail",
        password_field: "password",
        extra_fields: &[("m", "login")],
        csrf_selector: None,
        seed_cookies: &["search-recode=150", "stt_lang=en"],
    },
    search_url: "https://pelican-trade.jp/auction/",
    search_query: pelican_query,
    detail_url: pelican_detail,
    category_ids: &["1", "2", "3", "4", "5", "6"],
    categories: &[
        ("1", Category::Bag),
        ("2", Category::Watch),
        ("3", Category::Jewelry),
        ("4", Category::Clothing),
        ("5", Category::Liquor),
        ("6", Category::Other),
    ],
    listing: ListingSelectors {
        item_container: "ul.goods li",
        pagination_last: ".pager-block ul.pager li.last a",
        // Field map keys address the script payload's item objects.
        fields: &[
            ("id", "item_id"),
            ("title", "title"),
            ("brand", "brand"),
            ("rank", "rank"),
            ("starting_price", "start_price"),
            ("current_price", "current_price"),
            ("image", "thumbnail"),
            ("scheduled_date", "end_at"),
            ("status", "state"),
        ],
    },
    detail_fields: &[
        ("images", ".product_img_box .swiper-slide img@src"),
        ("brand", ".product_detail_table tr:nth-child(1) td"),
        ("material", ".product_detail_table tr:nth-child(3) td"),
        ("notes", ".product_comment_box"),
    ],
    strategy: ExtractionKind::EmbeddedScript { var: "items" },
    transport: TransportKind::Http,
    use_proxies: true,
    limits: ConcurrencyLimits {
        pages: 10,
        probes: 20,
        details: 10,
    },
    page_attempts: 3,
    retry_delay_ms: 1_000,
    page_timeout_secs: 30,
    session_ttl_secs: 3 * 3600,
    detail_pool_size: 2,
    page_size: 150,
    bid_mode: BidMode::Direct,
    closed_markers: &["落札済", "sold", "closed"],
    no_collection_weekdays: &[],
    translate_titles: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_category_code_falls_back_to_other() {
        assert_eq!(VERDE.category_label("1"), Category::Watch);
        assert_eq!(VERDE.category_label("999"), Category::Other);
    }

    #[test]
    fn listing_url_combines_search_url_and_query() {
        let url = VERDE.listing_url("2", 3);
        assert!(url.starts_with("https://www.verde-auction.com/client/auctions/inspect?"));
        assert!(url.contains("master_item_categories[0]=2"));
        assert!(url.contains("page=3"));
    }

    #[test]
    fn profiles_resolve_by_id() {
        assert!(by_id("verde").is_some());
        assert!(by_id("pelican").is_some());
        assert!(by_id("nonexistent").is_none());
    }
}
