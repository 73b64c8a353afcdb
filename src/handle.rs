use std::fmt;

use url::Url;

use crate::error::DataQualityError;

const MAX_HANDLE_LEN: usize = 30;
const PROFILE_HOST: &str = "instagram.com";

/// First path segments on the platform that are never a user profile.
const RESERVED_PATHS: &[&str] = &[
    "p", "reel", "reels", "explore", "stories", "accounts", "tv", "direct",
];

/// Canonical, lowercased recipient handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileHandle(String);

impl ProfileHandle {
    /// Accepts `name`, `@name` or a profile URL such as
    /// `https://www.instagram.com/name/?hl=en`.
    pub fn parse(raw: &str) -> Result<Self, DataQualityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(reject(raw, "empty"));
        }

        let candidate = if trimmed.contains("://") || trimmed.contains('/') {
            let with_scheme = if trimmed.contains("://") {
                trimmed.to_string()
            } else {
                format!("https://{trimmed}")
            };
            let url = Url::parse(&with_scheme).map_err(|_| reject(raw, "not a url"))?;
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            if host != PROFILE_HOST && !host.ends_with(".instagram.com") {
                return Err(reject(raw, "not a profile host"));
            }
            let segment = url
                .path_segments()
                .and_then(|mut s| s.find(|p| !p.is_empty()))
                .ok_or_else(|| reject(raw, "no profile path"))?;
            if RESERVED_PATHS.contains(&segment.to_ascii_lowercase().as_str()) {
                return Err(reject(raw, "not a profile path"));
            }
            segment.to_string()
        } else {
            trimmed.trim_start_matches('@').to_string()
        };

        let handle = candidate.to_ascii_lowercase();
        if handle.is_empty() || handle.len() > MAX_HANDLE_LEN {
            return Err(reject(raw, "bad length"));
        }
        if !handle
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
        {
            return Err(reject(raw, "invalid characters"));
        }
        Ok(Self(handle))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn reject(raw: &str, reason: &'static str) -> DataQualityError {
    DataQualityError {
        raw: raw.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_profile_urls() {
        let h = ProfileHandle::parse("https://www.instagram.com/Trattoria.Roma/?hl=en").unwrap();
        assert_eq!(h.as_str(), "trattoria.roma");
        let h = ProfileHandle::parse("instagram.com/pho_place").unwrap();
        assert_eq!(h.as_str(), "pho_place");
    }

    #[test]
    fn parses_bare_handles() {
        assert_eq!(ProfileHandle::parse("@Sushi_Bar").unwrap().as_str(), "sushi_bar");
        assert_eq!(ProfileHandle::parse("  tacos.42 ").unwrap().as_str(), "tacos.42");
    }

    #[test]
    fn rejects_non_profile_links() {
        assert!(ProfileHandle::parse("https://www.instagram.com/p/Cx12ab/").is_err());
        assert!(ProfileHandle::parse("https://www.instagram.com/").is_err());
        assert!(ProfileHandle::parse("https://facebook.com/somewhere").is_err());
        assert!(ProfileHandle::parse("https://notinstagram.com/someone/").is_err());
        assert!(ProfileHandle::parse("https://evil-instagram.com/someone/").is_err());
        assert!(ProfileHandle::parse("https://m.instagram.com/someone/").is_ok());
    }

    #[test]
    fn rejects_bad_characters_and_lengths() {
        assert!(ProfileHandle::parse("").is_err());
        assert!(ProfileHandle::parse("has space").is_err());
        assert!(ProfileHandle::parse(&"a".repeat(31)).is_err());
        let err = ProfileHandle::parse("bad-dash").unwrap_err();
        assert_eq!(err.reason, "invalid characters");
    }
}
