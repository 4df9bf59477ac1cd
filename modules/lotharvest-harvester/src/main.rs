use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lotharvest_common::Config;
use lotharvest_harvester::orchestrator::CrawlOrchestrator;
use lotharvest_harvester::profiles;
use lotharvest_harvester::session::SessionManager;

#[derive(Parser)]
#[command(
    name = "lotharvest",
    about = "Harvest auction-house listings into canonical item records"
)]
struct Args {
    /// Site ids to harvest; every known profile when omitted.
    #[arg(long = "site")]
    sites: Vec<String>,

    /// Run the lightweight price/date update pass instead of a full crawl.
    #[arg(long)]
    updates: bool,

    /// List known site profiles and exit.
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lotharvest_harvester=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if args.list {
        for profile in profiles::all() {
            println!("{}", profile.site_id);
        }
        return Ok(());
    }

    let config = Config::from_env();
    config.log_redacted();

    let selected: Vec<_> = if args.sites.is_empty() {
        profiles::all().to_vec()
    } else {
        args.sites
            .iter()
            .filter_map(|id| {
                let profile = profiles::by_id(id);
                if profile.is_none() {
                    error!(site = id.as_str(), "Unknown site id, skipping");
                }
                profile
            })
            .collect()
    };

    for profile in selected {
        info!(site = profile.site_id, "Starting site run");
        let credentials = config.credentials(profile.credential_key);
        let sessions = match SessionManager::new(profile, credentials, &config) {
            Ok(manager) => Arc::new(manager),
            Err(err) => {
                error!(site = profile.site_id, error = %err, "Session manager setup failed");
                continue;
            }
        };

        let orchestrator = CrawlOrchestrator::new(profile, sessions, None);
        // The persistence collaborator owns the real id set; standalone
        // runs start from an empty one.
        let existing = HashSet::new();

        if args.updates {
            match orchestrator.harvest_updates(&existing).await {
                Ok(updates) => {
                    info!(
                        site = profile.site_id,
                        updates = updates.len(),
                        "Update pass finished"
                    );
                }
                Err(err) => {
                    error!(site = profile.site_id, error = %err, "Update pass aborted");
                }
            }
        } else {
            match orchestrator.harvest(&existing).await {
                Ok(outcome) => {
                    info!(
                        site = profile.site_id,
                        items = outcome.items.len(),
                        "Site finished"
                    );
                    println!("{}", outcome.stats);
                }
                Err(err) => {
                    // A session failure aborts this site only; the loop
                    // moves on to the next property.
                    error!(site = profile.site_id, error = %err, "Site run aborted");
                }
            }
        }
    }

    Ok(())
}
