use std::path::Path;

use crate::error::ConfigError;
use crate::leads::Lead;

pub trait MessageComposer: Send + Sync {
    fn compose(&self, lead: &Lead) -> String;
}

const DEFAULT_TEMPLATES: &[&str] = &[
    "Hi {name}! We came across your place while looking at restaurants in {location} and loved what we saw. Would you be open to a quick chat about bringing in more local guests?",
    "Hello {name} team, your spot keeps coming up when people search {location}. We help restaurants turn that attention into bookings. Mind if I share how?",
    "Hey {name}, quick question: are you taking on new marketing partners in {location} this season? Happy to send over a few ideas.",
];

/// Picks one of its templates from the lead's identity and a fixed seed, so a
/// given lead always receives the same wording for the same seed.
pub struct TemplateComposer {
    templates: Vec<String>,
    seed: u64,
}

impl TemplateComposer {
    pub fn new(templates: Vec<String>, seed: u64) -> Result<Self, ConfigError> {
        if templates.is_empty() || templates.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "message templates must be non-empty".to_string(),
            ));
        }
        Ok(Self { templates, seed })
    }

    pub fn with_defaults(seed: u64) -> Self {
        Self {
            templates: DEFAULT_TEMPLATES.iter().map(|t| t.to_string()).collect(),
            seed,
        }
    }

    /// Reads a JSON array of template strings.
    pub fn from_file(path: &Path, seed: u64) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let templates: Vec<String> = serde_json::from_str(&raw).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::new(templates, seed)
    }
}

impl MessageComposer for TemplateComposer {
    fn compose(&self, lead: &Lead) -> String {
        let mixed = splitmix(fnv1a(lead.identity.as_bytes()) ^ self.seed);
        let idx = mixed % self.templates.len() as u64;
        self.templates[idx as usize]
            .replace("{name}", lead.identity.trim())
            .replace("{location}", &lead.location_key)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// FNV alone leaves the low bits poorly spread for short keys.
fn splitmix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_identity_same_message() {
        let composer = TemplateComposer::with_defaults(42);
        let lead = Lead::new("Bistro Mar", "lisbon");
        assert_eq!(composer.compose(&lead), composer.compose(&lead));
        assert!(composer.compose(&lead).contains("Bistro Mar"));
        assert!(composer.compose(&lead).contains("lisbon"));
    }

    #[test]
    fn seed_spreads_templates() {
        let composer = TemplateComposer::new(
            vec!["a {name}".to_string(), "b {name}".to_string()],
            0,
        )
        .unwrap();
        let firsts: std::collections::HashSet<char> = ["One", "Two", "Three", "Four", "Five", "Six"]
            .iter()
            .map(|n| composer.compose(&Lead::new(*n, "x")).chars().next().unwrap())
            .collect();
        assert_eq!(firsts.len(), 2);
    }

    #[test]
    fn rejects_empty_templates() {
        assert!(TemplateComposer::new(vec![], 1).is_err());
        assert!(TemplateComposer::new(vec!["  ".to_string()], 1).is_err());
    }
}
