use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::composer::{MessageComposer, TemplateComposer};
use crate::config::Config;
use crate::deliverer::{Deliverer, RemoteBrowserDeliverer};
use crate::enrich::{EnrichSummary, Enricher};
use crate::error::PersistenceError;
use crate::leads::{Lead, LeadStore};
use crate::lookup::{Lookup, SerperLookup};
use crate::pacing::DelayRange;
use crate::quota::{Capacity, QuotaTracker};
use crate::runner::{CampaignRunner, CampaignSettings, RunEvent, RunSummary, StopReason};
use crate::scrape::{ListingScraper, ScrapeMeta};
use crate::store::SqliteStore;

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub location: String,
    #[serde(default)]
    pub max_recipients: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TriggerResponse {
    Done { count: u32, message: String },
    Error { error: String, count: u32 },
}

impl TriggerResponse {
    fn error(error: impl Into<String>) -> Self {
        TriggerResponse::Error {
            error: error.into(),
            count: 0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScrapeOutcome {
    pub stored: usize,
    pub new_leads: usize,
    pub meta: ScrapeMeta,
}

/// Process-wide collaborators behind a trigger. Only one campaign may run at
/// a time per process.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub composer: Arc<dyn MessageComposer>,
    pub deliverer: Arc<dyn Deliverer>,
    pub lookup: Option<Arc<dyn Lookup>>,
}

pub struct Outreach {
    store: Arc<SqliteStore>,
    settings: CampaignSettings,
    quota: QuotaTracker,
    collab: Collaborators,
    enricher: Option<Enricher>,
    scraper: ListingScraper,
    campaign_lock: Mutex<()>,
}

impl Outreach {
    pub fn new(
        store: Arc<SqliteStore>,
        settings: CampaignSettings,
        lookup_delay: DelayRange,
        scraper: ListingScraper,
        collab: Collaborators,
    ) -> Self {
        let quota = QuotaTracker::new(store.clone(), collab.clock.clone(), settings.limits);
        let enricher = collab
            .lookup
            .clone()
            .map(|lookup| Enricher::new(lookup, lookup_delay));
        Self {
            store,
            settings,
            quota,
            collab,
            enricher,
            scraper,
            campaign_lock: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&cfg.db_path)?);
        let composer = match &cfg.templates_path {
            Some(path) => TemplateComposer::from_file(path, cfg.composer_seed)?,
            None => TemplateComposer::with_defaults(cfg.composer_seed),
        };
        let deliverer = RemoteBrowserDeliverer::new(
            &cfg.deliverer.base_url,
            cfg.deliverer.token.as_deref(),
            &cfg.deliverer.cookies_path,
        )?;
        let lookup: Option<Arc<dyn Lookup>> = match &cfg.lookup.api_key {
            Some(key) => Some(Arc::new(SerperLookup::new(&cfg.lookup.endpoint, key)?)),
            None => None,
        };

        Ok(Self::new(
            store,
            cfg.campaign.clone(),
            cfg.lookup.query_delay,
            ListingScraper::new(&cfg.scrape)?,
            Collaborators {
                clock: Arc::new(SystemClock),
                composer: Arc::new(composer),
                deliverer: Arc::new(deliverer),
                lookup,
            },
        ))
    }

    pub async fn run_campaign(
        &self,
        req: TriggerRequest,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> TriggerResponse {
        let location = req.location.trim();
        if location.is_empty() {
            return TriggerResponse::error("location is required");
        }
        let Ok(_running) = self.campaign_lock.try_lock() else {
            return TriggerResponse::error("campaign already running");
        };

        let leads = match self.store.leads_for_location(location) {
            Ok(leads) => leads,
            Err(e) => return TriggerResponse::error(e.to_string()),
        };

        let mut runner = CampaignRunner::new(
            self.settings.clone(),
            self.store.clone(),
            self.quota.clone(),
            self.collab.composer.clone(),
            self.collab.deliverer.clone(),
            self.collab.clock.clone(),
        );
        if let Some(tx) = events {
            runner = runner.with_events(tx);
        }

        match runner.run(&leads, location, req.max_recipients).await {
            Ok(summary) => TriggerResponse::Done {
                count: summary.sent,
                message: describe(&summary),
            },
            Err(e) if runner.sent() > 0 => TriggerResponse::error(format!(
                "{e} (after {} messages were sent and recorded)",
                runner.sent()
            )),
            Err(e) => TriggerResponse::error(e.to_string()),
        }
    }

    pub async fn scrape_location(
        &self,
        url: &str,
        location: &str,
        page_range: Option<usize>,
    ) -> Result<ScrapeOutcome> {
        let location = location.trim();
        if location.is_empty() {
            bail!("location is required");
        }
        let (listings, meta) = self.scraper.scrape(url, page_range).await?;
        let mut new_leads = 0;
        for listing in &listings {
            if self
                .store
                .upsert_lead(location, &listing.name, listing.listing_url.as_deref())?
            {
                new_leads += 1;
            }
        }
        info!(location, stored = listings.len(), new_leads, "listings stored as leads");
        Ok(ScrapeOutcome {
            stored: listings.len(),
            new_leads,
            meta,
        })
    }

    pub async fn enrich_location(&self, location: &str) -> Result<EnrichSummary> {
        let Some(enricher) = &self.enricher else {
            bail!("lookup API key not configured");
        };
        Ok(enricher
            .enrich_location(self.store.as_ref(), location.trim())
            .await?)
    }

    pub fn leads(&self, location: &str) -> Result<Vec<Lead>, PersistenceError> {
        self.store.leads_for_location(location.trim())
    }

    pub fn capacity(&self) -> Result<Capacity, PersistenceError> {
        self.quota.check_capacity()
    }
}

fn describe(summary: &RunSummary) -> String {
    let why = match summary.stop {
        StopReason::QuotaExhausted => "send quota exhausted",
        StopReason::CandidatesExhausted => "no eligible leads left",
        StopReason::RecipientCapReached => "recipient cap reached",
    };
    let mut msg = format!(
        "Sent {} message(s) in {}; {why}",
        summary.sent, summary.location
    );
    if !summary.failed.is_empty() {
        msg.push_str(&format!(
            "; {} failed after retries",
            summary.failed.len()
        ));
    }
    if summary.skipped_invalid > 0 {
        msg.push_str(&format!(
            "; {} skipped for unusable handles",
            summary.skipped_invalid
        ));
    }
    if summary.skipped_duplicate > 0 {
        msg.push_str(&format!(
            "; {} skipped as duplicate handles",
            summary.skipped_duplicate
        ));
    }
    msg
}
