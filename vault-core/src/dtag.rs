//! Logical record keys.
//!
//! A logical record is addressed by `projectId|environmentId`, carried in the
//! rumor's `d` tag. Composition rejects components that would make parsing
//! ambiguous, so `parse(compose(a, b)) == (a, b)` always holds.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between the project and environment components.
pub const SEPARATOR: char = '|';

/// A d-tag that cannot be mapped back to a (project, environment) pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    /// A component is empty
    #[error("d-tag component is empty: {0:?}")]
    EmptyComponent(String),

    /// A component contains the separator
    #[error("d-tag component contains '|': {0:?}")]
    ContainsSeparator(String),

    /// The tag has no separator at all
    #[error("d-tag has no separator: {0:?}")]
    MissingSeparator(String),
}

/// Parsed logical record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DTag {
    project: String,
    environment: String,
}

impl DTag {
    /// Compose a key from its two components.
    pub fn compose(project: &str, environment: &str) -> Result<Self, ConsistencyError> {
        for component in [project, environment] {
            if component.is_empty() {
                return Err(ConsistencyError::EmptyComponent(component.to_string()));
            }
            if component.contains(SEPARATOR) {
                return Err(ConsistencyError::ContainsSeparator(component.to_string()));
            }
        }
        Ok(Self {
            project: project.to_string(),
            environment: environment.to_string(),
        })
    }

    /// Parse a raw d-tag.
    ///
    /// Splits on the first separator only. Anything after it belongs to the
    /// environment, which keeps tags written by other clients readable as
    /// long as both halves are non-empty.
    pub fn parse(d: &str) -> Result<Self, ConsistencyError> {
        let (project, environment) = d
            .split_once(SEPARATOR)
            .ok_or_else(|| ConsistencyError::MissingSeparator(d.to_string()))?;
        if project.is_empty() || environment.is_empty() {
            return Err(ConsistencyError::EmptyComponent(d.to_string()));
        }
        Ok(Self {
            project: project.to_string(),
            environment: environment.to_string(),
        })
    }

    /// Project component.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Environment component.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Raw tag value.
    pub fn as_tag(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.project, SEPARATOR, self.environment)
    }
}

impl FromStr for DTag {
    type Err = ConsistencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Compose a raw d-tag string.
pub fn compose_dtag(project: &str, environment: &str) -> Result<String, ConsistencyError> {
    DTag::compose(project, environment).map(|d| d.to_string())
}

/// Parse a raw d-tag string into `(project, environment)`.
pub fn parse_dtag(d: &str) -> Result<(String, String), ConsistencyError> {
    DTag::parse(d).map(|d| (d.project, d.environment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_then_parse_roundtrips() {
        let raw = compose_dtag("proj", "prod").unwrap();
        assert_eq!(raw, "proj|prod");
        assert_eq!(parse_dtag(&raw).unwrap(), ("proj".into(), "prod".into()));
    }

    #[test]
    fn compose_rejects_separator() {
        assert!(matches!(
            DTag::compose("a|b", "c"),
            Err(ConsistencyError::ContainsSeparator(_))
        ));
        assert!(matches!(
            DTag::compose("a", "b|c"),
            Err(ConsistencyError::ContainsSeparator(_))
        ));
    }

    #[test]
    fn compose_rejects_empty() {
        assert!(matches!(
            DTag::compose("", "dev"),
            Err(ConsistencyError::EmptyComponent(_))
        ));
        assert!(DTag::compose("app", "").is_err());
    }

    #[test]
    fn parse_splits_on_first_separator_only() {
        let d = DTag::parse("a|b|c").unwrap();
        assert_eq!(d.project(), "a");
        assert_eq!(d.environment(), "b|c");
    }

    #[test]
    fn parse_rejects_missing_or_empty_parts() {
        assert!(matches!(
            DTag::parse("nodelimiter"),
            Err(ConsistencyError::MissingSeparator(_))
        ));
        assert!(DTag::parse("|env").is_err());
        assert!(DTag::parse("proj|").is_err());
        assert!(DTag::parse("|").is_err());
        assert!(DTag::parse("").is_err());
    }

    #[test]
    fn display_matches_raw_form() {
        let d: DTag = "app1|dev".parse().unwrap();
        assert_eq!(d.to_string(), "app1|dev");
        assert_eq!(d.as_tag(), "app1|dev");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConsistencyError>();
    }
}
