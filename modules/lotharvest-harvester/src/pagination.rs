use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::extract::{script_payload, ExtractionStrategy};
use crate::profiles::{ExtractionKind, SiteProfile};
use crate::transport::PageTransport;

static PAGE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]page=(\d+)").expect("valid regex"));

/// Determines how many listing pages a category has. Every strategy step
/// tolerates malformed input by falling through to the next; a category
/// that can't be measured is zero pages, never an error.
pub struct PaginationDiscoverer {
    profile: &'static SiteProfile,
    last_link: Selector,
}

impl PaginationDiscoverer {
    pub fn new(profile: &'static SiteProfile) -> Self {
        Self {
            profile,
            last_link: Selector::parse(profile.listing.pagination_last).expect("valid selector"),
        }
    }

    /// Fetch page 1 of a category and measure it.
    pub async fn discover(
        &self,
        transport: &dyn PageTransport,
        strategy: &dyn ExtractionStrategy,
        category_id: &str,
    ) -> u32 {
        let url = self.profile.listing_url(category_id, 1);
        match transport.fetch(&url).await {
            Ok(html) => self.pages_from_html(&html, strategy),
            Err(err) => {
                warn!(
                    site = self.profile.site_id,
                    category = category_id,
                    error = %err,
                    "Pagination probe failed; treating category as empty"
                );
                0
            }
        }
    }

    /// 1. last-page link's page parameter, else
    /// 2. pages/total metadata in an embedded script payload, else
    /// 3. 1 when at least one item row exists, else 0.
    pub fn pages_from_html(&self, html: &str, strategy: &dyn ExtractionStrategy) -> u32 {
        if let Some(pages) = self.pages_from_last_link(html) {
            return pages;
        }
        if let Some(pages) = self.pages_from_metadata(html) {
            return pages;
        }
        if strategy.handles(html).is_empty() {
            0
        } else {
            1
        }
    }

    fn pages_from_last_link(&self, html: &str) -> Option<u32> {
        let document = Html::parse_document(html);
        let link = document.select(&self.last_link).next()?;

        if let Some(pages) = link
            .value()
            .attr("href")
            .and_then(|href| PAGE_PARAM.captures(href))
            .and_then(|c| c[1].parse().ok())
        {
            return Some(pages);
        }

        // Some properties render the number as the link text instead.
        let text = link.text().collect::<String>();
        let digits: String = text.chars().filter(char::is_ascii_digit).collect();
        match digits.parse() {
            Ok(pages) => Some(pages),
            Err(_) => {
                debug!(text = text.trim(), "Last-page link without a usable number");
                None
            }
        }
    }

    fn pages_from_metadata(&self, html: &str) -> Option<u32> {
        let var = match self.profile.strategy {
            ExtractionKind::EmbeddedScript { var } => var,
            ExtractionKind::Dom => "pagination",
        };
        let payload = script_payload(html, var)
            .filter(|v| v.is_object())
            .or_else(|| script_payload(html, "pagination").filter(|v| v.is_object()))?;

        if let Some(pages) = payload.get("pages").and_then(|v| v.as_u64()) {
            return u32::try_from(pages).ok();
        }
        let total = payload.get("total").and_then(|v| v.as_u64())?;
        let per_page = u64::from(self.profile.page_size.max(1));
        u32::try_from(total.div_ceil(per_page)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::strategy_for;
    use crate::profiles::PELICAN;
    use crate::testing::{listing_page, FixtureItem, TEST_SITE};

    fn discoverer() -> PaginationDiscoverer {
        PaginationDiscoverer::new(&TEST_SITE)
    }

    #[test]
    fn last_link_page_parameter_wins() {
        let strategy = strategy_for(&TEST_SITE);
        let html = listing_page(
            &[FixtureItem::new("1", "Lot one", "¥100")],
            Some("/items?limit=50&page=17"),
        );
        assert_eq!(discoverer().pages_from_html(&html, &*strategy), 17);
    }

    #[test]
    fn link_without_digits_falls_through_to_item_presence() {
        let strategy = strategy_for(&TEST_SITE);
        let html = listing_page(&[FixtureItem::new("1", "Lot one", "¥100")], Some("/items"));
        assert_eq!(discoverer().pages_from_html(&html, &*strategy), 1);
    }

    #[test]
    fn no_link_one_item_row_is_one_page() {
        let strategy = strategy_for(&TEST_SITE);
        let html = listing_page(&[FixtureItem::new("1", "Lot one", "¥100")], None);
        assert_eq!(discoverer().pages_from_html(&html, &*strategy), 1);
    }

    #[test]
    fn empty_page_is_zero_pages() {
        let strategy = strategy_for(&TEST_SITE);
        let html = listing_page(&[], None);
        assert_eq!(discoverer().pages_from_html(&html, &*strategy), 0);
    }

    #[test]
    fn script_metadata_pages_field() {
        let strategy = strategy_for(&PELICAN);
        let html = r#"<html><head><script>
            window.items = JSON.parse('[]');
            window.pagination = {"pages": 6, "total": 812};
        </script></head><body></body></html>"#;
        let discoverer = PaginationDiscoverer::new(&PELICAN);
        assert_eq!(discoverer.pages_from_html(html, &*strategy), 6);
    }

    #[test]
    fn script_metadata_total_divides_by_page_size() {
        let strategy = strategy_for(&PELICAN);
        // 301 items at 150 per page is 3 pages.
        let html = r#"<html><head><script>
            window.pagination = {"total": 301};
        </script></head><body></body></html>"#;
        let discoverer = PaginationDiscoverer::new(&PELICAN);
        assert_eq!(discoverer.pages_from_html(html, &*strategy), 3);
    }
}
