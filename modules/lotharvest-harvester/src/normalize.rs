use chrono::NaiveDateTime;
use lotharvest_common::{HarvestError, ItemRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Map;

use crate::extract::RawItem;
use crate::profiles::SiteProfile;

/// Fields the canonical record consumes; everything else a strategy
/// surfaces rides along in `site_specific_metadata`.
const CONSUMED_FIELDS: &[&str] = &[
    "id",
    "title",
    "brand",
    "rank",
    "starting_price",
    "current_price",
    "image",
    "scheduled_date",
    "status",
];

/// Pure raw-fields → canonical-record transform for one site.
pub struct Normalizer {
    profile: &'static SiteProfile,
}

impl Normalizer {
    pub fn new(profile: &'static SiteProfile) -> Self {
        Self { profile }
    }

    pub fn normalize(
        &self,
        raw: &RawItem,
        category_id: &str,
    ) -> Result<ItemRecord, HarvestError> {
        let item_id = raw
            .get("id")
            .map(id_from_handle)
            .ok_or_else(|| HarvestError::Extraction("listing row without an item id".into()))?;

        let title = raw
            .get("title")
            .ok_or_else(|| HarvestError::Extraction(format!("item {item_id} has no title")))?;
        let original_title = strip_leading_brackets(full_width_to_ascii(title).trim());

        let starting_price = currency_to_int(raw.get("starting_price").ok_or_else(|| {
            HarvestError::Extraction(format!("item {item_id} has no starting price"))
        })?)?;
        let current_price = raw.get("current_price").and_then(|v| currency_to_int(v).ok());

        let raw_scheduled_date = raw.get("scheduled_date").map(str::to_string);
        let scheduled_date = raw_scheduled_date.as_deref().and_then(parse_scheduled);

        let mut metadata = Map::new();
        for (name, value) in raw.fields() {
            if !CONSUMED_FIELDS.contains(&name) {
                metadata.insert(name.to_string(), value.into());
            }
        }

        Ok(ItemRecord {
            item_id,
            site_id: self.profile.site_id.to_string(),
            original_title,
            translated_title: None,
            brand: raw.get("brand").map(|b| full_width_to_ascii(b).trim().to_string()),
            rank: raw.get("rank").map(clean_rank),
            starting_price,
            current_price,
            image: raw.get("image").map(str::to_string),
            additional_images: Vec::new(),
            category: self.profile.category_label(category_id),
            scheduled_date,
            raw_scheduled_date,
            bid_mode: self.profile.bid_mode,
            site_specific_metadata: metadata,
        })
    }
}

/// Listing links embed the id as the trailing path segment; bare ids pass
/// through unchanged.
pub fn id_from_handle(raw: &str) -> String {
    raw.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(raw)
        .to_string()
}

/// Strip everything but digits and parse. A digit-free string is
/// `InvalidCurrency`: the item is dropped, the batch is not.
pub fn currency_to_int(text: &str) -> Result<u64, HarvestError> {
    let digits: String = full_width_to_ascii(text)
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits
        .parse()
        .map_err(|_| HarvestError::InvalidCurrency(text.to_string()))
}

static DATE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}).?(\d{2}).?(\d{2}).*?(\d{1,2})\s*[：:]\s*(\d{2})").expect("valid regex")
});
static DATE_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4}).?(\d{2}).?(\d{2})").expect("valid regex"));

/// Two-pass date extraction: full date+time first, then date-only with the
/// time defaulted to midnight. Anything else is `None`, never an error.
pub fn extract_date(text: &str) -> Option<String> {
    if let Some(c) = DATE_TIME.captures(text) {
        return Some(format!(
            "{}-{}-{} {:0>2}:{}",
            &c[1], &c[2], &c[3], &c[4], &c[5]
        ));
    }
    let c = DATE_ONLY.captures(text)?;
    Some(format!("{}-{}-{} 00:00", &c[1], &c[2], &c[3]))
}

pub fn parse_scheduled(text: &str) -> Option<NaiveDateTime> {
    let normalized = extract_date(text)?;
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M").ok()
}

/// Shift full-width alphanumerics down by the standard offset and turn the
/// full-width space into a plain space.
pub fn full_width_to_ascii(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'Ａ'..='Ｚ' | 'ａ'..='ｚ' | '０'..='９' => {
                char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
            }
            '　' => ' ',
            _ => c,
        })
        .collect()
}

const RANK_SUFFIXES: &[&str] = &["ランク", "ﾗﾝｸ", "rank"];

/// Rank cells arrive as "ランク：A", "Aランク" or plain "A"; reduce them
/// all to the grade token.
pub fn clean_rank(text: &str) -> String {
    let folded = full_width_to_ascii(text);
    let mut cleaned = folded.trim();
    if let Some((_, after)) = cleaned.split_once(['：', ':']) {
        cleaned = after.trim();
    }
    let mut out = cleaned.to_string();
    for suffix in RANK_SUFFIXES {
        out = out.replace(suffix, "");
    }
    out.trim().to_string()
}

static LEADING_BRACKETS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\[(][^\])]*[\])]\s*").expect("valid regex"));

/// Drop a bracketed lead-in ("[USED] ", "(SALE) ") from a title.
pub fn strip_leading_brackets(title: &str) -> String {
    LEADING_BRACKETS.replace(title, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::VERDE;
    use lotharvest_common::Category;

    #[test]
    fn currency_parses_symbols_separators_and_plain() {
        assert_eq!(currency_to_int("¥12,345").unwrap(), 12345);
        assert_eq!(currency_to_int("12,345円").unwrap(), 12345);
        assert_eq!(currency_to_int("12345").unwrap(), 12345);
        assert_eq!(currency_to_int("１２，３４５円").unwrap(), 12345);
    }

    #[test]
    fn digit_free_currency_is_invalid() {
        assert!(matches!(
            currency_to_int("お問い合わせ"),
            Err(HarvestError::InvalidCurrency(_))
        ));
    }

    #[test]
    fn date_with_full_width_colon_normalizes() {
        assert_eq!(
            extract_date("2024.03.05 14：30").as_deref(),
            Some("2024-03-05 14:30")
        );
    }

    #[test]
    fn date_only_defaults_to_midnight() {
        assert_eq!(
            extract_date("2024/03/05").as_deref(),
            Some("2024-03-05 00:00")
        );
    }

    #[test]
    fn unparseable_date_is_none() {
        assert_eq!(extract_date("next Tuesday"), None);
        assert_eq!(extract_date(""), None);
    }

    #[test]
    fn full_width_conversion_covers_space() {
        assert_eq!(full_width_to_ascii("Ａ１２３　Ｂ"), "A123 B");
    }

    #[test]
    fn rank_cleanup_strips_localized_tokens() {
        assert_eq!(clean_rank("ランク：A"), "A");
        assert_eq!(clean_rank("ABランク"), "AB");
        assert_eq!(clean_rank(" S "), "S");
    }

    #[test]
    fn leading_brackets_are_removed() {
        assert_eq!(strip_leading_brackets("[USED] Rolex GMT"), "Rolex GMT");
        assert_eq!(strip_leading_brackets("(SALE) Birkin"), "Birkin");
        assert_eq!(strip_leading_brackets("Plain title"), "Plain title");
    }

    #[test]
    fn id_comes_from_trailing_path_segment() {
        assert_eq!(id_from_handle("/item/abc-123"), "abc-123");
        assert_eq!(id_from_handle("https://x.test/item/9/"), "9");
        assert_eq!(id_from_handle("4411"), "4411");
    }

    #[test]
    fn normalizes_a_full_raw_item() {
        let raw = RawItem::from_pairs([
            ("id", "8841"),
            ("title", "[NEW]　Ｏｍｅｇａ Speedmaster"),
            ("brand", "OMEGA"),
            ("rank", "ランク：AB"),
            ("starting_price", "¥120,000"),
            ("scheduled_date", "2024.03.05 14：30"),
            ("lot_no", "A-77"),
        ]);

        let record = Normalizer::new(&VERDE).normalize(&raw, "1").unwrap();
        assert_eq!(record.item_id, "8841");
        assert_eq!(record.original_title, "Omega Speedmaster");
        assert_eq!(record.rank.as_deref(), Some("AB"));
        assert_eq!(record.starting_price, 120_000);
        assert_eq!(record.category, Category::Watch);
        assert_eq!(
            record.scheduled_date.unwrap().format("%Y-%m-%d %H:%M").to_string(),
            "2024-03-05 14:30"
        );
        assert_eq!(record.site_specific_metadata["lot_no"], "A-77");
    }

    #[test]
    fn invalid_currency_drops_item_not_batch() {
        let normalizer = Normalizer::new(&VERDE);
        let bad = RawItem::from_pairs([
            ("id", "1"),
            ("title", "Lot one"),
            ("starting_price", "ask"),
        ]);
        let good = RawItem::from_pairs([
            ("id", "2"),
            ("title", "Lot two"),
            ("starting_price", "500"),
        ]);

        assert!(matches!(
            normalizer.normalize(&bad, "1"),
            Err(HarvestError::InvalidCurrency(_))
        ));
        assert_eq!(normalizer.normalize(&good, "1").unwrap().starting_price, 500);
    }
}
