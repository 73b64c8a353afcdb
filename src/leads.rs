use serde::Serialize;

use crate::error::PersistenceError;

/// A prospective contact. `identity` is unique within `location_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lead {
    pub identity: String,
    pub location_key: String,
    pub profile_handle: Option<String>,
    pub listing_url: Option<String>,
    /// Derived from send history when the lead was read.
    pub already_messaged: bool,
}

impl Lead {
    pub fn new(identity: impl Into<String>, location_key: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            location_key: location_key.into(),
            profile_handle: None,
            listing_url: None,
            already_messaged: false,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile_handle = Some(profile.into());
        self
    }
}

pub trait LeadStore: Send + Sync {
    /// Insert a lead if new. Re-scraping an existing lead keeps its position
    /// and any profile already found. Returns whether a row was inserted.
    fn upsert_lead(
        &self,
        location_key: &str,
        identity: &str,
        listing_url: Option<&str>,
    ) -> Result<bool, PersistenceError>;

    fn set_profile(
        &self,
        location_key: &str,
        identity: &str,
        profile_url: &str,
    ) -> Result<(), PersistenceError>;

    /// All leads of a location in insertion order.
    fn leads_for_location(&self, location_key: &str) -> Result<Vec<Lead>, PersistenceError>;

    fn leads_missing_profile(&self, location_key: &str) -> Result<Vec<Lead>, PersistenceError>;
}
