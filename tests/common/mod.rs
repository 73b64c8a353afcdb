#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::Notify;

use outreach::clock::ManualClock;
use outreach::composer::TemplateComposer;
use outreach::deliverer::{Deliverer, DeliverySession};
use outreach::error::{DeliveryError, PersistenceError, SetupError};
use outreach::handle::ProfileHandle;
use outreach::history::HistoryStore;
use outreach::leads::Lead;
use outreach::pacing::DelayRange;
use outreach::quota::{BucketCounts, CounterStore, QuotaLimits, QuotaTracker};
use outreach::runner::{CampaignRunner, CampaignSettings};
use outreach::store::SqliteStore;

pub const START: OffsetDateTime = datetime!(2024-06-01 14:05 UTC);

#[derive(Clone, Copy)]
pub enum Behaviour {
    Deliver,
    Refuse,
    Error,
    /// Fail this many times, then deliver.
    FailTimes(u32),
}

#[derive(Default)]
pub struct Log {
    pub opens: u32,
    pub closes: u32,
    pub attempts: HashMap<String, u32>,
    pub delivered: Vec<String>,
}

/// Deliverer whose per-handle outcome is scripted up front.
pub struct MockDeliverer {
    pub log: Arc<Mutex<Log>>,
    default: Behaviour,
    overrides: HashMap<String, Behaviour>,
    fail_open: bool,
    gate: Option<Arc<Gate>>,
}

/// Lets a test hold a send until it is released.
#[derive(Default)]
pub struct Gate {
    pub opened: Notify,
    pub release: Notify,
}

impl MockDeliverer {
    pub fn new(default: Behaviour) -> Self {
        Self {
            log: Arc::new(Mutex::new(Log::default())),
            default,
            overrides: HashMap::new(),
            fail_open: false,
            gate: None,
        }
    }

    pub fn with(mut self, handle: &str, behaviour: Behaviour) -> Self {
        self.overrides.insert(handle.to_string(), behaviour);
        self
    }

    pub fn failing_open() -> Self {
        let mut d = Self::new(Behaviour::Deliver);
        d.fail_open = true;
        d
    }

    pub fn gated(gate: Arc<Gate>) -> Self {
        let mut d = Self::new(Behaviour::Deliver);
        d.gate = Some(gate);
        d
    }

    pub fn attempts(&self, handle: &str) -> u32 {
        self.log.lock().unwrap().attempts.get(handle).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.log.lock().unwrap().attempts.values().sum()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.log.lock().unwrap().delivered.clone()
    }

    pub fn opens(&self) -> u32 {
        self.log.lock().unwrap().opens
    }

    pub fn closes(&self) -> u32 {
        self.log.lock().unwrap().closes
    }
}

#[async_trait]
impl Deliverer for MockDeliverer {
    async fn open(&self) -> Result<Box<dyn DeliverySession>, SetupError> {
        if self.fail_open {
            return Err(SetupError::Init("browser did not start".to_string()));
        }
        self.log.lock().unwrap().opens += 1;
        if let Some(gate) = &self.gate {
            gate.opened.notify_one();
        }
        Ok(Box::new(MockSession {
            log: self.log.clone(),
            default: self.default,
            overrides: self.overrides.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct MockSession {
    log: Arc<Mutex<Log>>,
    default: Behaviour,
    overrides: HashMap<String, Behaviour>,
    gate: Option<Arc<Gate>>,
}

#[async_trait]
impl DeliverySession for MockSession {
    async fn send(
        &mut self,
        handle: &ProfileHandle,
        _message: &str,
    ) -> Result<bool, DeliveryError> {
        if let Some(gate) = &self.gate {
            gate.release.notified().await;
        }
        let behaviour = self
            .overrides
            .get(handle.as_str())
            .copied()
            .unwrap_or(self.default);
        let mut log = self.log.lock().unwrap();
        let n = {
            let n = log.attempts.entry(handle.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let ok = match behaviour {
            Behaviour::Deliver => Ok(true),
            Behaviour::Refuse => Ok(false),
            Behaviour::Error => Err(DeliveryError::Network("connection reset".to_string())),
            Behaviour::FailTimes(k) if n <= k => {
                Err(DeliveryError::Rejected("message box not found".to_string()))
            }
            Behaviour::FailTimes(_) => Ok(true),
        };
        if matches!(ok, Ok(true)) {
            log.delivered.push(handle.to_string());
        }
        ok
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }
}

/// History that reads from a real store but can never write.
pub struct ReadOnlyHistory(pub Arc<SqliteStore>);

impl HistoryStore for ReadOnlyHistory {
    fn has_been_messaged(&self, identity: &str) -> Result<bool, PersistenceError> {
        self.0.has_been_messaged(identity)
    }

    fn record_sent(
        &self,
        _identity: &str,
        _location_key: &str,
        _when: OffsetDateTime,
    ) -> Result<bool, PersistenceError> {
        Err(PersistenceError("disk full".to_string()))
    }
}

/// Counters that read as empty but refuse every write.
pub struct LockedCounters;

impl CounterStore for LockedCounters {
    fn read_counts(&self, _date: &str, _hour: &str) -> Result<BucketCounts, PersistenceError> {
        Ok(BucketCounts::default())
    }

    fn try_increment(
        &self,
        _date: &str,
        _hour: &str,
        _limits: QuotaLimits,
    ) -> Result<bool, PersistenceError> {
        Err(PersistenceError("database is locked".to_string()))
    }
}

pub fn settings(hourly: u32, daily: u32) -> CampaignSettings {
    CampaignSettings {
        limits: QuotaLimits { hourly, daily },
        max_retries: 2,
        retry_delay: DelayRange::ZERO,
        message_delay: DelayRange::ZERO,
    }
}

pub fn lead(name: &str) -> Lead {
    Lead::new(name, "lisbon").with_profile(format!("https://www.instagram.com/{}/", name.to_lowercase()))
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub clock: Arc<ManualClock>,
    pub deliverer: Arc<MockDeliverer>,
    pub quota: QuotaTracker,
}

impl Harness {
    pub fn new(store: Arc<SqliteStore>, deliverer: MockDeliverer, limits: QuotaLimits) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let quota = QuotaTracker::new(store.clone(), clock.clone(), limits);
        Self {
            store,
            clock,
            deliverer: Arc::new(deliverer),
            quota,
        }
    }

    pub fn in_memory(deliverer: MockDeliverer, hourly: u32, daily: u32) -> Self {
        Self::new(
            Arc::new(SqliteStore::in_memory().unwrap()),
            deliverer,
            QuotaLimits { hourly, daily },
        )
    }

    pub fn with_counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.quota = QuotaTracker::new(counters, self.clock.clone(), self.quota.limits());
        self
    }

    pub fn runner(&self) -> CampaignRunner {
        self.runner_with_history(self.store.clone())
    }

    pub fn runner_with_history(&self, history: Arc<dyn HistoryStore>) -> CampaignRunner {
        let limits = self.quota.limits();
        CampaignRunner::new(
            settings(limits.hourly, limits.daily),
            history,
            self.quota.clone(),
            Arc::new(TemplateComposer::with_defaults(7)),
            self.deliverer.clone(),
            self.clock.clone(),
        )
    }
}
