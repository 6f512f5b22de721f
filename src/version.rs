//! Upload client version parsing
//!
//! Uploads self-identify with a free-text string such as
//! `"tidepool-uploader 0.99.2"` or `"uploader v2.1.0-beta.1+build"`. Only the
//! canonical uploader is held to a minimum version.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use semver::Version;

/// A parsed client version string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersion {
    /// Client name (first whitespace-delimited token)
    pub name: String,
    /// Embedded semantic version, if one could be found
    pub version: Option<Version>,
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"v?(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?)")
            .expect("static version pattern")
    })
}

impl ClientVersion {
    /// Parse a free-text client version. Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let name = raw.split_whitespace().next()?.to_string();
        let rest = &raw[name.len()..];
        // A bare "1.2.3" carries no name, only a version
        let (name, haystack) = if version_pattern().is_match(&name) && rest.trim().is_empty() {
            (String::new(), raw)
        } else {
            (name, rest)
        };
        let version = version_pattern()
            .captures(haystack)
            .and_then(|caps| caps.get(1))
            .and_then(|m| Version::parse(m.as_str()).ok());
        Some(Self { name, version })
    }

    /// Whether this client identifies as `uploader_name`
    pub fn is_client(&self, uploader_name: &str) -> bool {
        self.name.eq_ignore_ascii_case(uploader_name)
    }

    /// True only when a version was found and it is at least `minimum`
    pub fn meets(&self, minimum: &Version) -> bool {
        self.version.as_ref().map(|v| v >= minimum).unwrap_or(false)
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} {}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Parse a configured minimum version, tolerating a leading `v`
pub fn parse_minimum(raw: &str) -> Result<Version, semver::Error> {
    Version::parse(raw.strip_prefix('v').unwrap_or(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_version() {
        let v = ClientVersion::parse("tidepool-uploader 0.99.2").unwrap();
        assert_eq!(v.name, "tidepool-uploader");
        assert_eq!(v.version, Some(Version::new(0, 99, 2)));
        assert!(v.is_client("tidepool-uploader"));
    }

    #[test]
    fn test_parse_with_prefix_and_prerelease() {
        let v = ClientVersion::parse("uploader v2.1.0-beta.1").unwrap();
        assert_eq!(v.version.unwrap().to_string(), "2.1.0-beta.1");
    }

    #[test]
    fn test_parse_without_version() {
        let v = ClientVersion::parse("carelink-csv").unwrap();
        assert_eq!(v.version, None);
        assert!(!v.meets(&Version::new(0, 1, 0)));
        assert!(ClientVersion::parse("   ").is_none());
    }

    #[test]
    fn test_minimum_comparison() {
        let minimum = parse_minimum("v0.99.0").unwrap();
        assert!(ClientVersion::parse("tidepool-uploader 0.99.0").unwrap().meets(&minimum));
        assert!(ClientVersion::parse("tidepool-uploader 1.0.0").unwrap().meets(&minimum));
        assert!(!ClientVersion::parse("tidepool-uploader 0.98.9").unwrap().meets(&minimum));
    }
}
