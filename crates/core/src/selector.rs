//! Equality-based label selectors (`app=web,tier!=db,canary,!legacy`).

use std::fmt;
use std::str::FromStr;

use crate::Labels;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &Labels) -> bool {
        let get = |k: &str| labels.iter().find(|(lk, _)| lk == k).map(|(_, v)| v.as_str());
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v.as_str()),
            // A missing label satisfies `!=`, same as the API server.
            Requirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid selector term {0:?}")]
    InvalidTerm(String),
}

fn valid_label_key(k: &str) -> bool {
    !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

impl Selector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_everything(&self) -> bool { self.reqs.is_empty() }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut reqs = Vec::new();
        for raw in s.split(',') {
            let term = raw.trim();
            if term.is_empty() {
                if s.trim().is_empty() { continue; }
                return Err(SelectorError::InvalidTerm(raw.to_string()));
            }
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::DoesNotExist(k.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            let key_ok = match &req {
                Requirement::Equals(k, v) | Requirement::NotEquals(k, v) => valid_label_key(k) && !v.contains('='),
                Requirement::Exists(k) | Requirement::DoesNotExist(k) => valid_label_key(k),
            };
            if !key_ok { return Err(SelectorError::InvalidTerm(term.to_string())); }
            reqs.push(req);
        }
        Ok(Self { reqs })
    }

    /// Require `key=value`.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.reqs.push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.reqs.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = Selector::parse("").unwrap();
        assert!(s.is_everything());
        assert!(s.matches(&labels(&[])));
        assert!(Selector::everything().matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn equality_and_existence_terms() {
        let s = Selector::parse("app=web, tier!=db,canary,!legacy").unwrap();
        assert!(s.matches(&labels(&[("app", "web"), ("canary", "")])));
        assert!(!s.matches(&labels(&[("app", "web"), ("canary", ""), ("tier", "db")])));
        assert!(!s.matches(&labels(&[("app", "web"), ("canary", ""), ("legacy", "1")])));
        assert!(!s.matches(&labels(&[("app", "api"), ("canary", "")])));
        assert_eq!(s.to_string(), "app=web,tier!=db,canary,!legacy");
    }

    #[test]
    fn double_equals_is_accepted() {
        let s: Selector = "app==web".parse().unwrap();
        assert_eq!(s, Selector::everything().with_label("app", "web"));
    }

    #[test]
    fn invalid_terms_are_rejected() {
        assert!(Selector::parse("app=web,,tier=db").is_err());
        assert!(Selector::parse("=web").is_err());
        assert!(Selector::parse("a b").is_err());
        assert!(Selector::parse("a=b=c").is_err());
    }
}
