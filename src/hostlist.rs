//! Block and allow lists keyed by hostname substrings.

use url::Url;

/// Ordered set of hostname substrings. First match wins.
#[derive(Debug, Clone, Default)]
pub struct HostList {
    entries: Vec<String>,
}

impl HostList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim().to_ascii_lowercase();
            if !entry.is_empty() && !list.contains(&entry) {
                list.push(entry);
            }
        }
        Self { entries: list }
    }

    /// Return the first entry contained in `hostname`.
    pub fn matches(&self, hostname: &str) -> Option<&str> {
        let hostname = hostname.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|entry| hostname.contains(entry.as_str()))
            .map(|s| s.as_str())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hostname of an absolute URL, if it has one.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match() {
        let list = HostList::new(["facebook.com", "reddit.com"]);
        assert_eq!(list.matches("www.facebook.com"), Some("facebook.com"));
        assert_eq!(list.matches("old.reddit.com"), Some("reddit.com"));
        assert_eq!(list.matches("example.org"), None);
    }

    #[test]
    fn test_entries_normalized_and_deduplicated() {
        let list = HostList::new([" Facebook.com ", "facebook.com", "", "x.com"]);
        assert_eq!(list.entries(), &["facebook.com".to_string(), "x.com".to_string()]);
        assert_eq!(list.matches("M.FACEBOOK.COM"), Some("facebook.com"));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://www.Facebook.com/feed?x=1").as_deref(), Some("www.facebook.com"));
        assert_eq!(host_of("not a url"), None);
        assert_eq!(host_of("data:text/plain,hi"), None);
    }
}
