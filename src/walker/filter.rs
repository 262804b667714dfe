//! Path filters for the discovery walk.

use regex::Regex;

use crate::errors::SyncError;

/// Include/exclude regex filters applied to relative folder paths.
///
/// Exclude patterns short-circuit: any match rejects the path (and, since
/// filtering happens before a folder is enqueued, its whole subtree).
/// When include patterns exist, at least one must match.
#[derive(Debug, Default)]
pub struct PathFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    /// Compiles a filter from pattern strings.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error naming the first invalid pattern.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, SyncError> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Whether a relative path passes the filter.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|re| re.is_match(path))
    }

    /// Whether any patterns are configured at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, SyncError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| SyncError::config(format!("invalid filter pattern {p:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> PathFilter {
        PathFilter::new(
            &include.iter().map(ToString::to_string).collect::<Vec<_>>(),
            &exclude.iter().map(ToString::to_string).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let f = filter(&[], &[]);
        assert!(f.is_empty());
        assert!(f.matches("anything/at/all"));
        assert!(f.matches(""));
    }

    #[test]
    fn test_exclude_short_circuits() {
        let f = filter(&[], &["node_modules"]);
        assert!(!f.matches("project/node_modules"));
        assert!(!f.matches("project/node_modules/lib"));
        assert!(f.matches("project/src"));
    }

    #[test]
    fn test_include_must_match_when_present() {
        let f = filter(&["^docs"], &[]);
        assert!(f.matches("docs"));
        assert!(f.matches("docs/guides"));
        assert!(!f.matches("music"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let f = filter(&["^docs"], &["drafts"]);
        assert!(f.matches("docs/final"));
        assert!(!f.matches("docs/drafts"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let result = PathFilter::new(&["[unclosed".to_string()], &[]);
        let err = result.unwrap_err();
        assert_eq!(err.kind, crate::errors::SyncErrorKind::Config);
        assert!(err.message.contains("[unclosed"));
    }
}
