use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::ConfigError;
use crate::pacing::DelayRange;
use crate::quota::QuotaLimits;
use crate::runner::{CampaignSettings, MAX_RETRIES};
use crate::scrape::ListingSelectors;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub campaign: CampaignSettings,
    pub composer_seed: u64,
    pub templates_path: Option<PathBuf>,
    pub lookup: LookupConfig,
    pub deliverer: DelivererConfig,
    pub scrape: ScrapeConfig,
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub query_delay: DelayRange,
}

#[derive(Debug, Clone)]
pub struct DelivererConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub cookies_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub allowed_hosts: Vec<String>,
    pub page_cap: usize,
    pub selectors: ListingSelectors,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            db_path: PathBuf::from("outreach.db"),
            campaign: CampaignSettings::default(),
            composer_seed: 0,
            templates_path: None,
            lookup: LookupConfig {
                endpoint: "https://google.serper.dev/search".to_string(),
                api_key: None,
                query_delay: DelayRange::secs(2, 5),
            },
            deliverer: DelivererConfig {
                base_url: "http://127.0.0.1:3000".to_string(),
                token: None,
                cookies_path: PathBuf::from("cookies.json"),
            },
            scrape: ScrapeConfig {
                allowed_hosts: Vec::new(),
                page_cap: 200,
                selectors: ListingSelectors::default(),
            },
        }
    }
}

impl Config {
    /// Reads `OUTREACH_*` variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = var("OUTREACH_HOST") {
            cfg.host = v;
        }
        cfg.port = parsed("OUTREACH_PORT")?.unwrap_or(cfg.port);
        if let Some(v) = var("OUTREACH_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }

        let c = &mut cfg.campaign;
        c.limits = QuotaLimits {
            hourly: parsed("OUTREACH_HOURLY_LIMIT")?.unwrap_or(c.limits.hourly),
            daily: parsed("OUTREACH_DAILY_LIMIT")?.unwrap_or(c.limits.daily),
        };
        c.max_retries = parsed("OUTREACH_MAX_RETRIES")?.unwrap_or(MAX_RETRIES);
        c.retry_delay = delay_range("OUTREACH_RETRY_DELAY_SECS", c.retry_delay)?;
        c.message_delay = delay_range("OUTREACH_MESSAGE_DELAY_SECS", c.message_delay)?;
        cfg.composer_seed = parsed("OUTREACH_COMPOSER_SEED")?.unwrap_or(0);
        cfg.templates_path = var("OUTREACH_TEMPLATES_PATH").map(PathBuf::from);

        if let Some(v) = var("OUTREACH_LOOKUP_ENDPOINT") {
            cfg.lookup.endpoint = v;
        }
        cfg.lookup.api_key = var("OUTREACH_LOOKUP_API_KEY");
        cfg.lookup.query_delay =
            delay_range("OUTREACH_LOOKUP_DELAY_SECS", cfg.lookup.query_delay)?;

        if let Some(v) = var("OUTREACH_DELIVERER_URL") {
            cfg.deliverer.base_url = v;
        }
        cfg.deliverer.token = var("OUTREACH_DELIVERER_TOKEN");
        if let Some(v) = var("OUTREACH_COOKIES_PATH") {
            cfg.deliverer.cookies_path = PathBuf::from(v);
        }

        if let Some(v) = var("OUTREACH_ALLOWED_HOSTS") {
            cfg.scrape.allowed_hosts = v
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect();
        }
        cfg.scrape.page_cap = parsed("OUTREACH_PAGE_CAP")?.unwrap_or(cfg.scrape.page_cap);
        let s = &mut cfg.scrape.selectors;
        for (key, slot) in [
            ("OUTREACH_SELECTOR_CARD", &mut s.card),
            ("OUTREACH_SELECTOR_NAME", &mut s.name),
            ("OUTREACH_SELECTOR_LINK", &mut s.link),
            ("OUTREACH_SELECTOR_ADDRESS", &mut s.address),
        ] {
            if let Some(v) = var(key) {
                *slot = v;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = self.campaign.limits;
        if limits.hourly == 0 || limits.daily == 0 {
            return Err(ConfigError::Validation(
                "hourly and daily limits must be greater than zero".to_string(),
            ));
        }
        if limits.hourly > limits.daily {
            return Err(ConfigError::Validation(
                "hourly limit cannot exceed daily limit".to_string(),
            ));
        }
        for (name, range) in [
            ("retry delay", self.campaign.retry_delay),
            ("message delay", self.campaign.message_delay),
            ("lookup delay", self.lookup.query_delay),
        ] {
            if range.min > range.max {
                return Err(ConfigError::Validation(format!("{name} range is inverted")));
            }
        }
        if self.scrape.page_cap == 0 {
            return Err(ConfigError::Validation(
                "page cap must be greater than zero".to_string(),
            ));
        }
        self.scrape
            .selectors
            .compile()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(())
    }

    /// Logs the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        info!(
            bind = %format!("{}:{}", self.host, self.port),
            db = %self.db_path.display(),
            hourly_limit = self.campaign.limits.hourly,
            daily_limit = self.campaign.limits.daily,
            max_retries = self.campaign.max_retries,
            lookup_key = if self.lookup.api_key.is_some() { "set" } else { "unset" },
            deliverer = %self.deliverer.base_url,
            allowed_hosts = ?self.scrape.allowed_hosts,
            "configuration loaded"
        );
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match var(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

/// `"20-30"` or `"20"` in whole seconds.
fn delay_range(key: &'static str, default: DelayRange) -> Result<DelayRange, ConfigError> {
    let Some(raw) = var(key) else {
        return Ok(default);
    };
    let invalid = || ConfigError::Invalid {
        key,
        value: raw.clone(),
    };
    let (lo, hi) = match raw.split_once('-') {
        Some((lo, hi)) => (lo.trim(), hi.trim()),
        None => (raw.trim(), raw.trim()),
    };
    let lo: u64 = lo.parse().map_err(|_| invalid())?;
    let hi: u64 = hi.parse().map_err(|_| invalid())?;
    Ok(DelayRange {
        min: Duration::from_secs(lo),
        max: Duration::from_secs(hi),
    })
}
