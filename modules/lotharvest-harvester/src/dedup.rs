use std::collections::HashSet;

use chrono::Datelike;

use crate::extract::{ItemProbe, RawItem};
use crate::normalize;
use crate::profiles::SiteProfile;

/// Outcome of the cheap probe pass over one page's handles.
#[derive(Debug, Default)]
pub struct PagePartition {
    /// Handle indices that go on to full extraction.
    pub process: Vec<usize>,
    /// Already-known lots as (handle index, id), in handle order; each
    /// becomes a stub without ever reaching full extraction.
    pub stubs: Vec<(usize, String)>,
    /// Sold/closed lots excluded entirely.
    pub closed: u32,
    /// Lots excluded by the collection-day rule.
    pub skipped_collection_day: u32,
}

/// Split probed handles into stub / closed / process lists. Ids the caller
/// already knows never reach full extraction.
pub fn partition(
    probes: &[ItemProbe],
    existing_ids: &HashSet<String>,
    profile: &SiteProfile,
) -> PagePartition {
    let mut out = PagePartition::default();

    for (index, probe) in probes.iter().enumerate() {
        let Some(item_id) = probe.item_id.as_deref().map(normalize::id_from_handle) else {
            continue;
        };

        if !collection_day_allowed(probe.scheduled_date.as_deref(), profile) {
            out.skipped_collection_day += 1;
            continue;
        }

        if probe
            .status
            .as_deref()
            .is_some_and(|status| is_closed(status, profile.closed_markers))
        {
            out.closed += 1;
            continue;
        }

        if existing_ids.contains(&item_id) {
            out.stubs.push((index, item_id));
        } else {
            out.process.push(index);
        }
    }

    out
}

/// Free-text closed/sold detection. Upstream exposes no structured status
/// code, so this matches profile-configured label substrings after
/// full-width folding.
pub fn is_closed(status: &str, markers: &[&str]) -> bool {
    let folded = normalize::full_width_to_ascii(status).to_lowercase();
    markers
        .iter()
        .any(|marker| folded.contains(&marker.to_lowercase()))
}

fn collection_day_allowed(scheduled: Option<&str>, profile: &SiteProfile) -> bool {
    if profile.no_collection_weekdays.is_empty() {
        return true;
    }
    // An unscheduled lot stays in; only a known bad weekday excludes it.
    let Some(date) = scheduled.and_then(normalize::parse_scheduled) else {
        return true;
    };
    !profile.no_collection_weekdays.contains(&date.weekday())
}

/// Listing-exhaustion heuristic: a *new* row carrying an id but missing
/// the fields every real lot has means the listing has run past real
/// inventory into placeholder rows.
pub fn is_placeholder(raw: &RawItem) -> bool {
    raw.get("id").is_some() && (raw.get("title").is_none() || raw.get("starting_price").is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::VERDE;
    use crate::testing::TEST_SITE;

    fn probe(id: &str) -> ItemProbe {
        ItemProbe {
            item_id: Some(id.to_string()),
            scheduled_date: None,
            status: None,
        }
    }

    #[test]
    fn existing_ids_become_stubs_not_work() {
        let probes = vec![probe("1"), probe("2"), probe("3")];
        let existing: HashSet<String> = ["2".to_string()].into();

        let partition = partition(&probes, &existing, &TEST_SITE);

        assert_eq!(partition.stubs, vec![(1, "2".to_string())]);
        assert_eq!(partition.process, vec![0, 2]);
    }

    #[test]
    fn closed_lots_are_excluded_entirely() {
        let mut closed = probe("9");
        closed.status = Some("ＳＯＬＤ ＯＵＴ".to_string());
        let probes = vec![probe("8"), closed];

        let partition = partition(&probes, &HashSet::new(), &TEST_SITE);

        assert_eq!(partition.process, vec![0]);
        assert_eq!(partition.closed, 1);
        assert!(partition.stubs.is_empty());
    }

    #[test]
    fn handles_without_ids_are_dropped() {
        let probes = vec![ItemProbe::default(), probe("5")];
        let partition = partition(&probes, &HashSet::new(), &TEST_SITE);
        assert_eq!(partition.process, vec![1]);
    }

    #[test]
    fn collection_day_rule_excludes_configured_weekdays() {
        // 2024-03-05 is a Tuesday; VERDE skips Tue/Thu lots.
        let mut tuesday = probe("11");
        tuesday.scheduled_date = Some("2024.03.05 14：30".to_string());
        let mut friday = probe("12");
        friday.scheduled_date = Some("2024.03.08".to_string());

        let partition = partition(&[tuesday, friday], &HashSet::new(), &VERDE);

        assert_eq!(partition.process, vec![1]);
        assert_eq!(partition.skipped_collection_day, 1);
    }

    #[test]
    fn placeholder_rows_trigger_exhaustion() {
        let placeholder = RawItem::from_pairs([("id", "21")]);
        let real = RawItem::from_pairs([("id", "20"), ("title", "Lot"), ("starting_price", "100")]);

        assert!(is_placeholder(&placeholder));
        assert!(!is_placeholder(&real));
    }
}
