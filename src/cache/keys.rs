//! Cache key construction.
//!
//! Keys are plain strings built from ordered parts. Two call sites that pass
//! the same parts under the same context always produce the same key, which
//! is what lets unrelated code declare dependencies on each other's entries.

/// Separator between key parts.
pub const KEY_SEPARATOR: char = '|';

/// Namespace of the full-page (output) cache.
pub const FULL_PAGE_NAMESPACE: &str = "fullpage";

/// Builds normalized keys and applies the namespace context of this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBuilder {
    context: Option<String>,
}

impl KeyBuilder {
    /// Create a builder for the given context; blank contexts are ignored.
    pub fn new(context: Option<&str>) -> Self {
        let context = context
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Self { context }
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Join parts with [`KEY_SEPARATOR`].
    ///
    /// Empty parts still produce a separator so positions keep their meaning.
    pub fn build_key<I, S>(parts: I, lower_case: bool) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut key = String::new();
        for (index, part) in parts.into_iter().enumerate() {
            if index > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(part.as_ref());
        }
        if lower_case { key.to_lowercase() } else { key }
    }

    /// Prefix `key` with the active context, if any.
    pub fn full_key(&self, key: &str) -> String {
        match &self.context {
            Some(context) => format!("{context}-{key}"),
            None => key.to_string(),
        }
    }

    /// Lowercase unless case sensitive, then apply the context.
    pub fn normalize(&self, key: &str, case_sensitive: bool) -> String {
        if case_sensitive {
            self.full_key(key)
        } else {
            self.full_key(&key.to_lowercase())
        }
    }

    /// Prefix shared by every full-page cache key of `site` (or of all sites).
    pub fn full_page_prefix(site_name: Option<&str>) -> String {
        match site_name {
            Some(site) => {
                let mut prefix = Self::build_key([FULL_PAGE_NAMESPACE, site], true);
                prefix.push(KEY_SEPARATOR);
                prefix
            }
            None => format!("{FULL_PAGE_NAMESPACE}{KEY_SEPARATOR}"),
        }
    }

    /// Key of one full-page cache entry.
    pub fn full_page_key(site_name: &str, path: &str) -> String {
        Self::build_key([FULL_PAGE_NAMESPACE, site_name, path], true)
    }
}

/// The part of `key` before the first separator.
pub fn first_segment(key: &str) -> &str {
    key.split(KEY_SEPARATOR).next().unwrap_or(key)
}
