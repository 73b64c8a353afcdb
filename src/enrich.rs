use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::leads::LeadStore;
use crate::lookup::Lookup;
use crate::pacing::DelayRange;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichSummary {
    pub looked_up: u32,
    pub found: u32,
    pub failed: u32,
}

/// Fills in profile URLs for leads that have none yet.
pub struct Enricher {
    lookup: Arc<dyn Lookup>,
    pace: DelayRange,
}

impl Enricher {
    pub fn new(lookup: Arc<dyn Lookup>, pace: DelayRange) -> Self {
        Self { lookup, pace }
    }

    pub async fn enrich_location(
        &self,
        store: &dyn LeadStore,
        location: &str,
    ) -> Result<EnrichSummary, PersistenceError> {
        let pending = store.leads_missing_profile(location)?;
        let mut summary = EnrichSummary::default();

        for (i, lead) in pending.iter().enumerate() {
            if i > 0 {
                self.pace.pause().await;
            }
            let query = format!("{} {} instagram", lead.identity, location);
            summary.looked_up += 1;

            match self.lookup.search(&query).await {
                Ok(Some(profile)) => {
                    store.set_profile(location, &lead.identity, &profile)?;
                    summary.found += 1;
                    info!(identity = %lead.identity, profile = %profile, "profile found");
                }
                Ok(None) => info!(identity = %lead.identity, "no profile found"),
                Err(e) => {
                    summary.failed += 1;
                    warn!(identity = %lead.identity, error = %e, "lookup failed");
                }
            }
        }

        info!(
            location,
            looked_up = summary.looked_up,
            found = summary.found,
            failed = summary.failed,
            "enrichment finished"
        );
        Ok(summary)
    }
}
