//! Request-interception rules applied to every navigation.
//!
//! A [`RequestFilter`] is a plain value: backends ask it whether a request
//! should be blocked and never mutate it, so one filter can be handed to any
//! number of pages at once.

use std::collections::HashSet;

use url::Url;

/// Resource class of an outgoing page request, as reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    Xhr,
    Fetch,
    Other,
}

/// Hosts of analytics and ad endpoints the target site loads on every page.
pub const DEFAULT_BLOCKED_HOSTS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "facebook.net",
    "hotjar.com",
    "sentry.io",
];

/// Decides which requests a page may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFilter {
    blocked_kinds: HashSet<ResourceKind>,
    blocked_hosts: Vec<String>,
}

impl RequestFilter {
    /// A filter that lets every request through.
    pub fn allow_all() -> Self {
        Self {
            blocked_kinds: HashSet::new(),
            blocked_hosts: Vec::new(),
        }
    }

    /// Images, fonts, and media, with no host rules.
    pub fn default_kinds() -> Self {
        Self::allow_all().with_blocked_kinds([
            ResourceKind::Image,
            ResourceKind::Font,
            ResourceKind::Media,
        ])
    }

    /// Block the given resource classes.
    pub fn with_blocked_kinds(mut self, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        self.blocked_kinds.extend(kinds);
        self
    }

    /// Block requests to these hosts and their subdomains.
    pub fn with_blocked_hosts<S: AsRef<str>>(mut self, hosts: impl IntoIterator<Item = S>) -> Self {
        self.blocked_hosts.extend(
            hosts
                .into_iter()
                .map(|h| h.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty()),
        );
        self
    }

    /// Returns true if the request must be failed instead of sent.
    ///
    /// Top-level documents are never blocked.
    pub fn should_block(&self, kind: ResourceKind, url: &str) -> bool {
        if kind == ResourceKind::Document {
            return false;
        }
        if self.blocked_kinds.contains(&kind) {
            return true;
        }
        if self.blocked_hosts.is_empty() {
            return false;
        }
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };
        self.blocked_hosts.iter().any(|blocked| {
            host == *blocked
                || host
                    .strip_suffix(blocked.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// True if the filter can block anything at all.
    pub fn is_active(&self) -> bool {
        !self.blocked_kinds.is_empty() || !self.blocked_hosts.is_empty()
    }
}

impl Default for RequestFilter {
    /// Images, fonts, media, and the default tracking hosts.
    fn default() -> Self {
        Self::default_kinds().with_blocked_hosts(DEFAULT_BLOCKED_HOSTS)
    }
}
