use std::time::Duration;

/// Per-run accumulator. Returned by the orchestrator for that run; never
/// shared or global.
#[derive(Debug, Default)]
pub struct HarvestStats {
    pub categories_crawled: u32,
    pub pages_fetched: u32,
    pub pages_failed: u32,
    pub items_extracted: u32,
    pub stubs_emitted: u32,
    pub closed_skipped: u32,
    pub collection_day_skipped: u32,
    pub dropped_invalid: u32,
    pub translation_calls: u32,
    pub exhaustion_stops: u32,
    pub elapsed: Duration,
}

/// "1h 3m 20s" style duration for the summary block.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{minutes}m "));
    }
    out.push_str(&format!("{seconds}s"));
    out
}

impl std::fmt::Display for HarvestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Harvest Run Complete ===")?;
        writeln!(f, "Categories crawled: {}", self.categories_crawled)?;
        writeln!(f, "Pages fetched:      {}", self.pages_fetched)?;
        writeln!(f, "Pages failed:       {}", self.pages_failed)?;
        writeln!(f, "Items extracted:    {}", self.items_extracted)?;
        writeln!(f, "Dedup stubs:        {}", self.stubs_emitted)?;
        writeln!(f, "Closed lots skipped:{}", self.closed_skipped)?;
        writeln!(f, "No-collection days: {}", self.collection_day_skipped)?;
        writeln!(f, "Dropped (invalid):  {}", self.dropped_invalid)?;
        writeln!(f, "Translation calls:  {}", self.translation_calls)?;
        writeln!(f, "Exhaustion stops:   {}", self.exhaustion_stops)?;
        writeln!(f, "Elapsed:            {}", format_elapsed(self.elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_elapsed_with_units() {
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_elapsed(Duration::from_secs(3724)), "1h 2m 4s");
    }
}
