use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Map;

// --- Canonical categories ---

/// Fixed label set every site's category table resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Watch,
    Bag,
    Jewelry,
    Accessory,
    Clothing,
    Shoes,
    Goods,
    Liquor,
    Other,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Watch => write!(f, "watch"),
            Category::Bag => write!(f, "bag"),
            Category::Jewelry => write!(f, "jewelry"),
            Category::Accessory => write!(f, "accessory"),
            Category::Clothing => write!(f, "clothing"),
            Category::Shoes => write!(f, "shoes"),
            Category::Goods => write!(f, "goods"),
            Category::Liquor => write!(f, "liquor"),
            Category::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BidMode {
    /// Live auction-floor lot; price advances on the floor.
    AuctionFloor,
    /// Direct/tender sale at a listed price.
    Direct,
}

// --- Canonical item record ---

/// Normalized, site-agnostic representation of one auction lot.
///
/// `item_id` is unique within `site_id`. Image fields hold source URLs
/// until the image ingest collaborator rewrites them to local paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: String,
    pub site_id: String,
    pub original_title: String,
    pub translated_title: Option<String>,
    pub brand: Option<String>,
    pub rank: Option<String>,
    pub starting_price: u64,
    pub current_price: Option<u64>,
    pub image: Option<String>,
    pub additional_images: Vec<String>,
    pub category: Category,
    pub scheduled_date: Option<NaiveDateTime>,
    pub raw_scheduled_date: Option<String>,
    pub bid_mode: BidMode,
    /// Opaque per-site fields, forwarded to collaborators uninterpreted.
    pub site_specific_metadata: Map<String, serde_json::Value>,
}

/// One output per raw listing handle: either a fully extracted record or a
/// dedup stub for an item the caller already knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HarvestedItem {
    Record(Box<ItemRecord>),
    Stub { item_id: String },
}

impl HarvestedItem {
    pub fn item_id(&self) -> &str {
        match self {
            HarvestedItem::Record(r) => &r.item_id,
            HarvestedItem::Stub { item_id } => item_id,
        }
    }

    pub fn as_record(&self) -> Option<&ItemRecord> {
        match self {
            HarvestedItem::Record(r) => Some(r),
            HarvestedItem::Stub { .. } => None,
        }
    }
}

/// Price/date delta produced by the lightweight update-only pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub item_id: String,
    pub site_id: String,
    pub current_price: Option<u64>,
    pub scheduled_date: Option<NaiveDateTime>,
}

/// Ephemeral unit of page-level work; carries no identity beyond one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    pub site_id: String,
    pub category_id: String,
    pub page: u32,
}
