//! Runtime configuration sourced from the `NOTIFICATIONS_*` environment
//! variables.

use std::env;

const DEFAULT_CONTENT_TYPE: &str = "message/rfc822";
const DEFAULT_DURATION_SECS: u64 = 3600;
const DEFAULT_MAX_DURATION_SECS: u64 = 7200;

#[derive(Debug, Clone)]
pub struct Config {
    /// Default accept list for `configure` when no explicit config is given.
    pub default_content_types: Vec<String>,
    pub default_duration_secs: u64,
    pub max_duration_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_content_types: vec![DEFAULT_CONTENT_TYPE.to_owned()],
            default_duration_secs: DEFAULT_DURATION_SECS,
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        let default_content_types = env::var("NOTIFICATIONS_CONTENT_TYPES")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_owned()).collect())
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_CONTENT_TYPE.to_owned()]);

        let default_duration_secs = env::var("NOTIFICATIONS_DURATION")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DURATION_SECS);

        let max_duration_secs = env::var("NOTIFICATIONS_DURATION_MAX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_DURATION_SECS);

        Self {
            default_content_types,
            default_duration_secs,
            max_duration_secs,
        }
    }

    /// Honors a client-requested stream duration: used when present, a
    /// positive integer, and within `max_duration_secs`; falls back to
    /// `default_duration_secs` otherwise.
    #[must_use]
    pub fn resolve_duration(&self, requested: Option<u64>) -> u64 {
        match requested {
            Some(secs) if secs > 0 && secs <= self.max_duration_secs => secs,
            _ => self.default_duration_secs,
        }
    }

    /// Renders the `accept=(...)` offer fragment `configure` falls back to
    /// when the caller doesn't supply its own config string, built from
    /// `default_content_types` rather than a hardcoded media type.
    #[must_use]
    pub fn default_accept_fragment(&self) -> String {
        let members = self
            .default_content_types
            .iter()
            .map(|content_type| format!("\"{content_type}\""))
            .collect::<Vec<_>>()
            .join(" ");
        format!("accept=({members})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_duration_uses_requested_value_within_bounds() {
        let config = Config::default();
        assert_eq!(config.resolve_duration(Some(120)), 120);
    }

    #[test]
    fn resolve_duration_falls_back_when_zero_or_over_max() {
        let config = Config::default();
        assert_eq!(config.resolve_duration(Some(0)), config.default_duration_secs);
        assert_eq!(
            config.resolve_duration(Some(config.max_duration_secs + 1)),
            config.default_duration_secs
        );
    }

    #[test]
    fn resolve_duration_falls_back_when_absent() {
        let config = Config::default();
        assert_eq!(config.resolve_duration(None), config.default_duration_secs);
    }

    #[test]
    fn default_accept_fragment_reflects_configured_content_types() {
        let config = Config::default();
        assert_eq!(config.default_accept_fragment(), r#"accept=("message/rfc822")"#);

        let config = Config {
            default_content_types: vec!["message/rfc822".to_owned(), "application/json".to_owned()],
            ..Config::default()
        };
        assert_eq!(
            config.default_accept_fragment(),
            r#"accept=("message/rfc822" "application/json")"#
        );
    }
}
