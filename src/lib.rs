//! Restaurant lead outreach: scrape listings, enrich them with social
//! profiles, and message them under hourly and daily send quotas without ever
//! contacting the same recipient twice.

pub mod clock;
pub mod composer;
pub mod config;
pub mod deliverer;
pub mod enrich;
pub mod error;
pub mod handle;
pub mod history;
pub mod leads;
pub mod lookup;
pub mod pacing;
pub mod quota;
pub mod runner;
pub mod scrape;
pub mod selector;
pub mod service;
pub mod store;
