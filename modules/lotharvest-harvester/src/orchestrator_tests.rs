//! Orchestrator end-to-end tests over mock transports: register listing
//! pages, run a harvest, assert on records, stubs, and which URLs were
//! (never) requested.

use std::collections::HashSet;
use std::sync::Arc;

use lotharvest_common::{HarvestError, HarvestedItem};

use crate::orchestrator::CrawlOrchestrator;
use crate::testing::*;

fn page_url(page: u32) -> String {
    TEST_SITE.listing_url("1", page)
}

fn lots(range: std::ops::RangeInclusive<u32>) -> Vec<FixtureItem> {
    range
        .map(|i| FixtureItem::new(&i.to_string(), &format!("Lot {i}"), "¥10,000"))
        .collect()
}

fn orchestrator(transport: Arc<MockTransport>) -> (CrawlOrchestrator, Arc<MockSessionProvider>) {
    let sessions = Arc::new(MockSessionProvider::new(transport));
    (
        CrawlOrchestrator::new(&TEST_SITE, sessions.clone(), None),
        sessions,
    )
}

#[tokio::test]
async fn full_run_with_dedup_and_exhaustion() {
    // Three real pages over ids 1-20; the pager claims five. Page 3 runs
    // into placeholder rows, so pages 4 and 5 must never be requested.
    let mut page3 = lots(16..=20);
    page3.push(FixtureItem::placeholder("21"));
    page3.push(FixtureItem::placeholder("22"));

    let transport = Arc::new(
        MockTransport::new()
            .on_page(&page_url(1), listing_page(&lots(1..=8), Some("?category=1&page=5")))
            .on_page(&page_url(2), listing_page(&lots(9..=15), None))
            .on_page(&page_url(3), listing_page(&page3, None)),
    );
    let (orchestrator, sessions) = orchestrator(transport.clone());

    let outcome = orchestrator.harvest(&existing_ids(1..=5)).await.unwrap();

    let stubs: Vec<&str> = outcome
        .items
        .iter()
        .filter_map(|item| match item {
            HarvestedItem::Stub { item_id } => Some(item_id.as_str()),
            HarvestedItem::Record(_) => None,
        })
        .collect();
    assert_eq!(stubs, vec!["1", "2", "3", "4", "5"]);

    let record_ids: Vec<u32> = outcome
        .items
        .iter()
        .filter_map(|item| item.as_record())
        .map(|record| record.item_id.parse().unwrap())
        .collect();
    assert_eq!(record_ids, (6..=20).collect::<Vec<_>>());
    assert!(outcome
        .items
        .iter()
        .filter_map(|item| item.as_record())
        .all(|record| record.original_title.starts_with("Lot ")));

    assert_eq!(outcome.stats.exhaustion_stops, 1);
    assert_eq!(outcome.stats.pages_fetched, 3);

    let fetched = transport.fetched();
    assert!(!fetched.iter().any(|url| url.contains("page=4")));
    assert!(!fetched.iter().any(|url| url.contains("page=5")));
    assert!(sessions.listing_closed());
}

#[tokio::test]
async fn session_failure_aborts_the_site_run() {
    let orchestrator = CrawlOrchestrator::new(&TEST_SITE, Arc::new(FailingSessionProvider), None);

    let result = orchestrator.harvest(&HashSet::new()).await;

    let err = result.err().expect("run must abort");
    assert!(matches!(err, HarvestError::Session { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn empty_category_is_successful_and_empty() {
    let transport =
        Arc::new(MockTransport::new().on_page(&page_url(1), listing_page(&[], None)));
    let (orchestrator, _) = orchestrator(transport);

    let outcome = orchestrator.harvest(&HashSet::new()).await.unwrap();

    assert!(outcome.items.is_empty());
    assert_eq!(outcome.stats.categories_crawled, 1);
    assert_eq!(outcome.stats.pages_fetched, 0);
}

#[tokio::test]
async fn failed_page_is_skipped_and_the_run_continues() {
    // The pager claims two pages but page 2 is dead; page 1's items still
    // come back and the failure is counted, not raised.
    let transport = Arc::new(MockTransport::new().on_page(
        &page_url(1),
        listing_page(&lots(1..=3), Some("?category=1&page=2")),
    ));
    let (orchestrator, _) = orchestrator(transport.clone());

    let outcome = orchestrator.harvest(&HashSet::new()).await.unwrap();

    assert_eq!(outcome.items.len(), 3);
    assert_eq!(outcome.stats.pages_failed, 1);
    // Two attempts per the profile's retry budget.
    assert_eq!(transport.fetch_count(&page_url(2)), 2);
}

#[tokio::test]
async fn closed_lots_never_surface() {
    let items = vec![
        FixtureItem::new("1", "Open lot", "¥5,000"),
        FixtureItem::new("2", "Gone lot", "¥5,000").with_status("Sold Out"),
    ];
    let transport =
        Arc::new(MockTransport::new().on_page(&page_url(1), listing_page(&items, None)));
    let (orchestrator, _) = orchestrator(transport);

    let outcome = orchestrator.harvest(&HashSet::new()).await.unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].item_id(), "1");
    assert_eq!(outcome.stats.closed_skipped, 1);
}

#[tokio::test]
async fn invalid_currency_drops_the_item_only() {
    let items = vec![
        FixtureItem::new("1", "Priced lot", "¥5,000"),
        FixtureItem::new("2", "Ask-price lot", "お問い合わせ"),
    ];
    let transport =
        Arc::new(MockTransport::new().on_page(&page_url(1), listing_page(&items, None)));
    let (orchestrator, _) = orchestrator(transport);

    let outcome = orchestrator.harvest(&HashSet::new()).await.unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.stats.dropped_invalid, 1);
    assert_eq!(outcome.stats.items_extracted, 1);
}

#[tokio::test]
async fn translator_fills_translated_titles() {
    let transport = Arc::new(
        MockTransport::new().on_page(&page_url(1), listing_page(&lots(1..=2), None)),
    );
    let translator = Arc::new(MockTranslator::new());
    let sessions = Arc::new(MockSessionProvider::new(transport));
    let orchestrator =
        CrawlOrchestrator::new(&TEST_SITE, sessions, Some(translator.clone()));

    let outcome = orchestrator.harvest(&HashSet::new()).await.unwrap();

    assert_eq!(translator.calls(), 2);
    assert_eq!(outcome.stats.translation_calls, 2);
    let record = outcome.items[0].as_record().unwrap();
    assert_eq!(record.translated_title.as_deref(), Some("[en] Lot 1"));
}

#[tokio::test]
async fn update_pass_emits_price_deltas_for_known_ids_only() {
    let items = vec![
        FixtureItem::new("1", "Known lot", "¥5,000")
            .with_current("¥7,500")
            .with_scheduled("2024.03.05 14：30"),
        FixtureItem::new("2", "New lot", "¥5,000").with_current("¥6,000"),
    ];
    let transport =
        Arc::new(MockTransport::new().on_page(&page_url(1), listing_page(&items, None)));
    let (orchestrator, _) = orchestrator(transport);

    let updates = orchestrator
        .harvest_updates(&existing_ids(1..=1))
        .await
        .unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].item_id, "1");
    assert_eq!(updates[0].current_price, Some(7_500));
    assert_eq!(
        updates[0]
            .scheduled_date
            .unwrap()
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        "2024-03-05 14:30"
    );
}

#[tokio::test]
async fn detail_fetch_pulls_images_from_styles() {
    let detail_html = r#"<html><body>
        <div class="item-thumbnail" style="background-image: url('https://cdn.test/a.jpg?s=80')"></div>
        <div class="item-thumbnail" style="background-image: url('https://cdn.test/b.jpg')"></div>
        <p class="desc">Light scratches on the clasp.</p>
    </body></html>"#;
    let transport = Arc::new(
        MockTransport::new().on_page("https://test.example.com/item/77", detail_html),
    );
    let (orchestrator, _) = orchestrator(transport);

    let details = orchestrator.fetch_item_details("77", 0).await.unwrap().unwrap();

    assert_eq!(details.item_id, "77");
    assert_eq!(
        details.additional_images,
        vec!["https://cdn.test/a.jpg", "https://cdn.test/b.jpg"]
    );
    assert_eq!(
        details.fields["description"],
        "Light scratches on the clasp."
    );
}

#[tokio::test]
async fn missing_detail_page_is_none_not_error() {
    let (orchestrator, _) = orchestrator(Arc::new(MockTransport::new()));
    let details = orchestrator.fetch_item_details("404", 0).await.unwrap();
    assert!(details.is_none());
}
