//! Allowlist policy deciding whether an identifier may start an OpenID exchange.
//!
//! Both allowlists default to [`Allowlist::Open`], which lets every identifier
//! through. A deployment restricts logins by configuring at least one entry,
//! which turns the list into [`Allowlist::Restricted`].

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// An allowlist that is either unrestricted or limited to the given entries.
#[derive(Clone, Debug, PartialEq)]
pub enum Allowlist<T> {
    Open,
    Restricted(Vec<T>),
}

impl<T> Allowlist<T> {
    /// An absent or empty entry list yields an open allowlist.
    pub fn from_entries(entries: Option<Vec<T>>) -> Self {
        match entries {
            Some(entries) if !entries.is_empty() => Allowlist::Restricted(entries),
            _ => Allowlist::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Allowlist::Open)
    }
}

impl<T> Default for Allowlist<T> {
    fn default() -> Self {
        Allowlist::Open
    }
}

/// One entry of the provider allowlist.
#[derive(Clone, Debug)]
pub enum ProviderMatcher {
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl PartialEq for ProviderMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ProviderMatcher::Exact(a), ProviderMatcher::Exact(b))
            | (ProviderMatcher::Prefix(a), ProviderMatcher::Prefix(b)) => a == b,
            (ProviderMatcher::Pattern(a), ProviderMatcher::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl ProviderMatcher {
    /// Whether this entry accepts the given provider endpoint.
    pub fn accepts(&self, endpoint: &str) -> bool {
        match self {
            ProviderMatcher::Exact(s) => endpoint == s,
            ProviderMatcher::Prefix(p) => endpoint.starts_with(p.as_str()),
            ProviderMatcher::Pattern(re) => re.is_match(endpoint),
        }
    }
}

impl FromStr for ProviderMatcher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("exact:") {
            return Ok(ProviderMatcher::Exact(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("prefix:") {
            return Ok(ProviderMatcher::Prefix(rest.to_string()));
        }
        let pattern = s.strip_prefix("regex:").unwrap_or(s);
        Regex::new(pattern)
            .map(ProviderMatcher::Pattern)
            .map_err(|e| format!("invalid provider pattern '{pattern}': {e}"))
    }
}

impl fmt::Display for ProviderMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderMatcher::Exact(s) => write!(f, "exact:{s}"),
            ProviderMatcher::Prefix(p) => write!(f, "prefix:{p}"),
            ProviderMatcher::Pattern(re) => write!(f, "regex:{}", re.as_str()),
        }
    }
}

/// Exact-match check of an identifier against the identifier allowlist.
pub fn is_authorized_identifier(identifier: Option<&str>, allowlist: &Allowlist<String>) -> bool {
    debug!(
        identifier = identifier.unwrap_or_default(),
        ?allowlist,
        "checking for valid openid identifier"
    );
    let Allowlist::Restricted(entries) = allowlist else {
        return true;
    };
    let Some(identifier) = identifier else {
        return false;
    };
    entries.iter().any(|entry| {
        debug!(identifier, candidate = %entry, "comparing openid identifier");
        identifier == entry
    })
}

/// Match a provider endpoint against the provider allowlist; the first accepting entry wins.
pub fn is_authorized_provider(
    endpoint: Option<&str>,
    allowlist: &Allowlist<ProviderMatcher>,
) -> bool {
    debug!(
        endpoint = endpoint.unwrap_or_default(),
        ?allowlist,
        "checking for valid openid provider"
    );
    let Allowlist::Restricted(matchers) = allowlist else {
        return true;
    };
    let Some(endpoint) = endpoint else {
        return false;
    };
    matchers.iter().any(|matcher| {
        debug!(endpoint, candidate = %matcher, "comparing openid provider");
        matcher.accepts(endpoint)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(entries: &[&str]) -> Allowlist<ProviderMatcher> {
        Allowlist::from_entries(Some(
            entries.iter().map(|e| e.parse().unwrap()).collect(),
        ))
    }

    #[test]
    fn open_lists_allow_everything() {
        let ids = Allowlist::<String>::from_entries(None);
        let empty = Allowlist::<String>::from_entries(Some(vec![]));
        let provs = Allowlist::<ProviderMatcher>::from_entries(None);

        assert!(is_authorized_identifier(Some("https://anyone"), &ids));
        assert!(is_authorized_identifier(Some("https://anyone"), &empty));
        assert!(is_authorized_identifier(None, &ids));
        assert!(is_authorized_provider(Some("https://op"), &provs));
        assert!(is_authorized_provider(None, &provs));
    }

    #[test]
    fn identifier_requires_exact_entry() {
        let ids = Allowlist::from_entries(Some(vec!["https://x".to_string()]));
        assert!(is_authorized_identifier(Some("https://x"), &ids));
        assert!(!is_authorized_identifier(Some("https://x/"), &ids));
        assert!(!is_authorized_identifier(Some("https://xy"), &ids));
        assert!(!is_authorized_identifier(None, &ids));
    }

    #[test]
    fn bare_provider_entry_is_an_unanchored_pattern() {
        let provs = providers(&["myopenid\\.com"]);
        assert!(is_authorized_provider(Some("https://bob.myopenid.com/"), &provs));
        assert!(!is_authorized_provider(Some("https://example.org/"), &provs));
    }

    #[test]
    fn tagged_provider_entries() {
        let provs = providers(&["exact:https://op.example/", "prefix:https://id.corp/"]);
        assert!(is_authorized_provider(Some("https://op.example/"), &provs));
        assert!(!is_authorized_provider(Some("https://op.example/x"), &provs));
        assert!(is_authorized_provider(Some("https://id.corp/alice"), &provs));
        assert!(!is_authorized_provider(None, &provs));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!("regex:(".parse::<ProviderMatcher>().is_err());
    }
}
