use std::sync::Arc;

use crate::error::PersistenceError;
use crate::history::HistoryStore;
use crate::leads::Lead;

pub struct CandidateSelector {
    history: Arc<dyn HistoryStore>,
}

impl CandidateSelector {
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self { history }
    }

    /// Leads of `location` that have a profile and no send record, in input
    /// order. History is consulted as each candidate is pulled, so a send
    /// recorded mid-iteration is seen by the rest of the sequence.
    pub fn select_eligible<'a>(
        &'a self,
        leads: &'a [Lead],
        location: &'a str,
    ) -> Eligible<'a> {
        Eligible {
            leads: leads.iter(),
            location,
            history: self.history.as_ref(),
        }
    }
}

pub struct Eligible<'a> {
    leads: std::slice::Iter<'a, Lead>,
    location: &'a str,
    history: &'a dyn HistoryStore,
}

impl<'a> Iterator for Eligible<'a> {
    type Item = Result<&'a Lead, PersistenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        for lead in self.leads.by_ref() {
            if lead.location_key != self.location || lead.profile_handle.is_none() {
                continue;
            }
            match self.history.has_been_messaged(&lead.identity) {
                Ok(true) => continue,
                Ok(false) => return Some(Ok(lead)),
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
