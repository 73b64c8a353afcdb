//! The campaign state machine.
//!
//! `Idle -> Initializing -> Sending -> Draining(reason) -> Closed`, with
//! `Failed` reachable from any state on a setup or persistence error.
//!
//! Per candidate: reserve quota, compose, deliver with bounded retries, and
//! record history only on confirmed delivery. Quota is reserved on attempt
//! and never refunded, since the platform rate-limits attempts, not just
//! successes. The inter-message pause runs before the reservation so a
//! reservation is always charged to the hour its attempt goes out in.
//! A recipient is recorded only after the deliverer confirmed the send; a
//! crash between confirmation and the history write can therefore lead to a
//! second message on the next run.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::composer::MessageComposer;
use crate::deliverer::{Deliverer, DeliverySession};
use crate::error::{CampaignError, DeliveryError};
use crate::handle::ProfileHandle;
use crate::history::HistoryStore;
use crate::leads::Lead;
use crate::pacing::DelayRange;
use crate::quota::{Capacity, QuotaLimits, QuotaTracker};
use crate::selector::CandidateSelector;

pub const MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct CampaignSettings {
    pub limits: QuotaLimits,
    /// Extra attempts after the first failed one.
    pub max_retries: u32,
    pub retry_delay: DelayRange,
    pub message_delay: DelayRange,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            limits: QuotaLimits::default(),
            max_retries: MAX_RETRIES,
            retry_delay: DelayRange::secs(20, 30),
            message_delay: DelayRange::secs(45, 90),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QuotaExhausted,
    CandidatesExhausted,
    RecipientCapReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Sending,
    Draining(StopReason),
    Closed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub location: String,
    pub sent: u32,
    /// Recipients whose retries ran out. They stay eligible for a later run.
    pub failed: Vec<String>,
    pub skipped_invalid: u32,
    /// Leads sharing a handle with one already attempted in this run.
    pub skipped_duplicate: u32,
    pub attempts: u32,
    pub stop: StopReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        location: String,
        capacity: Capacity,
    },
    Sent {
        identity: String,
        handle: String,
        attempts: u32,
    },
    Failed {
        identity: String,
        attempts: u32,
        error: String,
    },
    Skipped {
        identity: String,
        reason: String,
    },
    Finished {
        summary: RunSummary,
    },
}

struct Delivery {
    delivered: bool,
    attempts: u32,
    last_error: Option<String>,
}

pub struct CampaignRunner {
    settings: CampaignSettings,
    history: Arc<dyn HistoryStore>,
    quota: QuotaTracker,
    composer: Arc<dyn MessageComposer>,
    deliverer: Arc<dyn Deliverer>,
    clock: Arc<dyn Clock>,
    events: Option<mpsc::Sender<RunEvent>>,
    state: RunState,
    sent: u32,
}

impl CampaignRunner {
    pub fn new(
        settings: CampaignSettings,
        history: Arc<dyn HistoryStore>,
        quota: QuotaTracker,
        composer: Arc<dyn MessageComposer>,
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            history,
            quota,
            composer,
            deliverer,
            clock,
            events: None,
            state: RunState::Idle,
            sent: 0,
        }
    }

    /// Progress events are best effort; a dropped receiver does not stop the run.
    pub fn with_events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Messages sent and recorded by the last run, including one that failed.
    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub async fn run(
        &mut self,
        leads: &[Lead],
        location: &str,
        max_recipients: Option<u32>,
    ) -> Result<RunSummary, CampaignError> {
        self.sent = 0;
        self.transition(RunState::Initializing);
        let capacity = match self.quota.check_capacity() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "cannot read quota counters");
                self.transition(RunState::Failed);
                return Err(e.into());
            }
        };
        info!(
            location,
            hourly_remaining = capacity.hourly_remaining,
            daily_remaining = capacity.daily_remaining,
            "campaign starting"
        );
        self.emit(RunEvent::Started {
            location: location.to_string(),
            capacity,
        })
        .await;

        let mut summary = RunSummary {
            location: location.to_string(),
            sent: 0,
            failed: Vec::new(),
            skipped_invalid: 0,
            skipped_duplicate: 0,
            attempts: 0,
            stop: StopReason::CandidatesExhausted,
        };

        let early_stop = if capacity.is_exhausted() {
            Some(StopReason::QuotaExhausted)
        } else if max_recipients == Some(0) {
            Some(StopReason::RecipientCapReached)
        } else {
            None
        };
        if let Some(stop) = early_stop {
            summary.stop = stop;
            self.transition(RunState::Draining(stop));
            self.transition(RunState::Closed);
            self.finish(&summary).await;
            return Ok(summary);
        }

        let mut session = match self.deliverer.open().await {
            Ok(s) => SessionGuard::new(s),
            Err(e) => {
                error!(error = %e, "deliverer setup failed, no messages sent");
                self.transition(RunState::Failed);
                return Err(e.into());
            }
        };

        self.transition(RunState::Sending);
        let outcome = self
            .send_loop(
                session.session.as_mut(),
                leads,
                location,
                max_recipients,
                &mut summary,
            )
            .await;
        if let Ok(stop) = &outcome {
            self.transition(RunState::Draining(*stop));
        }
        session.close().await;
        self.sent = summary.sent;

        match outcome {
            Ok(stop) => {
                summary.stop = stop;
                self.transition(RunState::Closed);
                self.finish(&summary).await;
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, sent = summary.sent, "campaign aborted");
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn send_loop(
        &self,
        session: &mut dyn DeliverySession,
        leads: &[Lead],
        location: &str,
        max_recipients: Option<u32>,
        summary: &mut RunSummary,
    ) -> Result<StopReason, CampaignError> {
        let selector = CandidateSelector::new(self.history.clone());
        let mut eligible = selector.select_eligible(leads, location);
        let mut contacted: HashSet<ProfileHandle> = HashSet::new();

        loop {
            if max_recipients.is_some_and(|cap| summary.sent >= cap) {
                return Ok(StopReason::RecipientCapReached);
            }
            let Some(candidate) = eligible.next() else {
                return Ok(StopReason::CandidatesExhausted);
            };
            let lead = candidate?;

            let raw = lead.profile_handle.as_deref().unwrap_or_default();
            let handle = match ProfileHandle::parse(raw) {
                Ok(h) => h,
                Err(e) => {
                    summary.skipped_invalid += 1;
                    warn!(identity = %lead.identity, error = %e, "skipping lead");
                    self.emit(RunEvent::Skipped {
                        identity: lead.identity.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                    continue;
                }
            };

            if contacted.contains(&handle) {
                summary.skipped_duplicate += 1;
                warn!(identity = %lead.identity, handle = %handle, "handle already contacted in this run, skipping");
                self.emit(RunEvent::Skipped {
                    identity: lead.identity.clone(),
                    reason: format!("handle {handle} already contacted in this run"),
                })
                .await;
                continue;
            }

            if !contacted.is_empty() {
                self.settings.message_delay.pause().await;
            }
            if !self.quota.try_reserve()? {
                info!(sent = summary.sent, "quota exhausted, draining");
                return Ok(StopReason::QuotaExhausted);
            }
            contacted.insert(handle.clone());

            let message = self.composer.compose(lead);
            let delivery = self.deliver(session, &handle, &message).await;
            summary.attempts += delivery.attempts;

            if delivery.delivered {
                let now = self.clock.now();
                if let Err(e) = self
                    .history
                    .record_sent(&lead.identity, &lead.location_key, now)
                {
                    error!(
                        identity = %lead.identity,
                        handle = %handle,
                        error = %e,
                        "delivered but not recorded; recipient may be messaged again"
                    );
                    return Err(e.into());
                }
                summary.sent += 1;
                info!(identity = %lead.identity, handle = %handle, attempts = delivery.attempts, "message sent");
                self.emit(RunEvent::Sent {
                    identity: lead.identity.clone(),
                    handle: handle.to_string(),
                    attempts: delivery.attempts,
                })
                .await;
            } else {
                let err = delivery.last_error.unwrap_or_default();
                warn!(identity = %lead.identity, attempts = delivery.attempts, error = %err, "delivery failed, moving on");
                summary.failed.push(lead.identity.clone());
                self.emit(RunEvent::Failed {
                    identity: lead.identity.clone(),
                    attempts: delivery.attempts,
                    error: err,
                })
                .await;
            }
        }
    }

    async fn deliver(
        &self,
        session: &mut dyn DeliverySession,
        handle: &ProfileHandle,
        message: &str,
    ) -> Delivery {
        let total = self.settings.max_retries + 1;
        let mut last_error = None;
        for attempt in 1..=total {
            if attempt > 1 {
                self.settings.retry_delay.pause().await;
            }
            match session.send(handle, message).await {
                Ok(true) => {
                    return Delivery {
                        delivered: true,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Ok(false) => {
                    debug!(handle = %handle, attempt, "delivery not confirmed");
                    last_error = Some("delivery not confirmed".to_string());
                }
                Err(e) => {
                    debug!(handle = %handle, attempt, error = %e, "delivery attempt failed");
                    last_error = Some(e.to_string());
                }
            }
        }
        Delivery {
            delivered: false,
            attempts: total,
            last_error,
        }
    }

    fn transition(&mut self, to: RunState) {
        debug!(from = ?self.state, to = ?to, "campaign state");
        self.state = to;
    }

    async fn finish(&self, summary: &RunSummary) {
        info!(
            location = %summary.location,
            sent = summary.sent,
            failed = summary.failed.len(),
            skipped = summary.skipped_invalid,
            duplicates = summary.skipped_duplicate,
            attempts = summary.attempts,
            stop = ?summary.stop,
            "campaign finished"
        );
        self.emit(RunEvent::Finished {
            summary: summary.clone(),
        })
        .await;
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// Owns the open delivery session. If the run future is dropped before
/// `close` finished, the session is closed on a spawned task instead.
struct SessionGuard {
    session: Box<dyn DeliverySession>,
    closed: bool,
}

impl SessionGuard {
    fn new(session: Box<dyn DeliverySession>) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.session.close().await;
        self.closed = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut session = std::mem::replace(&mut self.session, Box::new(Released));
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!("campaign dropped mid-run, releasing delivery session");
                rt.spawn(async move { session.close().await });
            }
            Err(_) => error!("campaign dropped outside a runtime, delivery session leaked"),
        }
    }
}

/// Stand-in left behind once a guard handed its session to the release task.
struct Released;

#[async_trait]
impl DeliverySession for Released {
    async fn send(
        &mut self,
        _handle: &ProfileHandle,
        _message: &str,
    ) -> Result<bool, DeliveryError> {
        Err(DeliveryError::Rejected("session already released".to_string()))
    }

    async fn close(&mut self) {}
}
