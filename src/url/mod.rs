//! URL utilities for the crawler's hot path
//!
//! These are byte-level scanners, not full URL parsing: they locate host
//! spans, path starts and attribute-value ends inside raw HTML, and they
//! resolve possibly-relative links against a base page. They return byte
//! offsets and allocate only where a new URL string is the result. Full
//! parsing (validation of the seed URL, connection setup) goes through
//! the `url` crate at the configuration and client boundaries instead.

use std::fmt;

/// Upper bound on the URL length any scanner will look at.
pub const MAX_URL_LEN: usize = 8192;

/// A fixed six-byte scheme buffer holding `"http\0\0"` or `"https\0"`.
///
/// Child nodes inherit the parent's scheme by value, so the buffer is
/// deliberately `Copy` and never heap-allocates.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Scheme([u8; 6]);

impl Scheme {
    pub fn http() -> Self {
        Scheme(*b"http\0\0")
    }

    pub fn https() -> Self {
        Scheme(*b"https\0")
    }

    /// Builds a scheme buffer from a parsed URL scheme; anything other
    /// than `http`/`https` is unsupported.
    pub fn from_url_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::http()),
            "https" => Some(Self::https()),
            _ => None,
        }
    }

    /// The scheme as text, without the NUL padding. Empty until set.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Debug for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scheme({:?})", self.as_str())
    }
}

/// Extracts `"host[:port]"` from a URL.
///
/// The host span starts right after the first `"://"` (or at the string
/// start if there is none) and ends at the next `'/'` or at the end of
/// the string.
///
/// ```
/// use pagegrep::url::extract_host_port;
///
/// assert_eq!(extract_host_port("https://site.com:443/a/b"), "site.com:443");
/// assert_eq!(extract_host_port("site.com/a"), "site.com");
/// ```
pub fn extract_host_port(target_url: &str) -> String {
    let rest = match target_url.find("://") {
        Some(pos) => &target_url[pos + 3..],
        None => target_url,
    };
    match rest.find('/') {
        Some(slash) => rest[..slash].to_string(),
        None => rest.to_string(),
    }
}

/// Returns the offset of the first byte after a `"://"` sequence found
/// within the first `min(nmax, MAX_URL_LEN)` bytes, or `nmax` if there
/// is none. A string that begins with `'/'` is already a local path and
/// yields offset 0.
pub fn find_address_begin(s: &str, nmax: usize) -> usize {
    let bytes = s.as_bytes();
    if bytes.first() == Some(&b'/') {
        return 0;
    }
    let bound = nmax.min(MAX_URL_LEN).min(bytes.len());
    if bound >= 3 {
        for pos in 0..=bound - 3 {
            if &bytes[pos..pos + 3] == b"://" {
                return pos + 3;
            }
        }
    }
    nmax
}

/// Returns the offset of the first `'/'` at or after the address-begin
/// offset, capped at `min(nmax, MAX_URL_LEN)`.
pub fn find_path_begin(s: &str, nmax: usize) -> usize {
    let bytes = s.as_bytes();
    let bound = nmax.min(MAX_URL_LEN);
    let addr = find_address_begin(s, nmax);
    let start = if addr >= bound { 0 } else { addr };
    (start..bound.min(bytes.len()))
        .find(|&pos| bytes[pos] == b'/')
        .unwrap_or(bound)
}

/// Scans forward to the first attribute-terminating byte and returns the
/// offset reached, or `s.len()` when none is found.
///
/// The terminators are the ones that can end an unquoted or quoted href
/// value in raw HTML: `"` `'` newline `>` space `<` NUL.
pub fn find_closing_quote(s: &str) -> usize {
    const STOP_CHARS: &[u8] = b"\"'\n> <\0";
    let bytes = s.as_bytes();
    bytes
        .iter()
        .position(|b| STOP_CHARS.contains(b))
        .unwrap_or(bytes.len())
}

/// Unfolds a short link into an absolute URL using the base page's URL,
/// host and scheme.
///
/// Three cases:
/// - no leading `'/'` and no `"://"` anywhere in the link: a sibling
///   path, resolved as `base_url + "/" + link`;
/// - leading `'/'`: an absolute path on the same host, resolved as
///   `scheme + "://" + host_and_port + link`;
/// - anything else already carries a scheme and is returned unchanged.
///
/// ```
/// use pagegrep::url::{make_full_path, Scheme};
///
/// let full = make_full_path("/a/b", "s.example", "https://s.example/", Scheme::https());
/// assert_eq!(full, "https://s.example/a/b");
/// ```
pub fn make_full_path(link: &str, host_and_port: &str, base_url: &str, scheme: Scheme) -> String {
    let addr = find_address_begin(link, link.len());
    if !link.starts_with('/') && addr >= link.len() {
        let mut path = String::with_capacity(base_url.len() + 1 + link.len());
        path.push_str(base_url);
        path.push('/');
        path.push_str(link);
        path
    } else if link.starts_with('/') {
        let mut path =
            String::with_capacity(scheme.as_str().len() + 3 + host_and_port.len() + link.len());
        path.push_str(scheme.as_str());
        path.push_str("://");
        path.push_str(host_and_port);
        path.push_str(link);
        path
    } else {
        link.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_buffers() {
        assert_eq!(Scheme::http().as_bytes(), b"http\0\0");
        assert_eq!(Scheme::https().as_bytes(), b"https\0");
        assert_eq!(Scheme::http().as_str(), "http");
        assert_eq!(Scheme::https().as_str(), "https");
        assert!(Scheme::default().is_empty());
        assert_eq!(Scheme::from_url_scheme("ftp"), None);
        assert_eq!(Scheme::from_url_scheme("https"), Some(Scheme::https()));
    }

    #[test]
    fn test_extract_host_port_with_port() {
        assert_eq!(extract_host_port("https://site.com:443/a/b"), "site.com:443");
    }

    #[test]
    fn test_extract_host_port_without_scheme() {
        assert_eq!(extract_host_port("site.com/a"), "site.com");
    }

    #[test]
    fn test_extract_host_port_no_path() {
        assert_eq!(extract_host_port("http://site.com"), "site.com");
    }

    #[test]
    fn test_find_address_begin_local_path() {
        assert_eq!(find_address_begin("/local", 100), 0);
    }

    #[test]
    fn test_find_address_begin_after_scheme() {
        assert_eq!(find_address_begin("http://x/path", 100), 7);
        assert_eq!(find_address_begin("https://x", 100), 8);
    }

    #[test]
    fn test_find_address_begin_absent() {
        assert_eq!(find_address_begin("no-scheme", 9), 9);
        assert_eq!(find_address_begin("no-scheme", 42), 42);
    }

    #[test]
    fn test_find_address_begin_empty() {
        assert_eq!(find_address_begin("", 5), 5);
    }

    #[test]
    fn test_find_path_begin() {
        assert_eq!(find_path_begin("http://x/path", 13), 8);
        assert_eq!(find_path_begin("/already/path", 13), 0);
        // no '/' after the host: capped at the bound
        assert_eq!(find_path_begin("http://x", 8), 8);
    }

    #[test]
    fn test_find_closing_quote() {
        assert_eq!(find_closing_quote("abc\"def"), 3);
        assert_eq!(find_closing_quote("abc'def"), 3);
        assert_eq!(find_closing_quote("abc>def"), 3);
        assert_eq!(find_closing_quote("abc def"), 3);
        assert_eq!(find_closing_quote("nothing-to-stop"), 15);
        assert_eq!(find_closing_quote(""), 0);
    }

    #[test]
    fn test_make_full_path_sibling() {
        let full = make_full_path("img/a.png", "site.com", "http://site.com/dir", Scheme::http());
        assert_eq!(full, "http://site.com/dir/img/a.png");
    }

    #[test]
    fn test_make_full_path_rooted() {
        let full = make_full_path("/a/b", "s.example", "https://s.example/", Scheme::https());
        assert_eq!(full, "https://s.example/a/b");
    }

    #[test]
    fn test_make_full_path_rooted_keeps_port() {
        let full = make_full_path("/x", "site.com:8080", "http://site.com:8080/", Scheme::http());
        assert_eq!(full, "http://site.com:8080/x");
    }

    #[test]
    fn test_make_full_path_absolute_is_unchanged() {
        for absolute in [
            "http://site.com/path",
            "https://site.com:443/a/b",
            "https://other.example/",
        ] {
            let full = make_full_path(absolute, "ignored.com", "http://ignored.com", Scheme::http());
            assert_eq!(full, absolute);
        }
    }
}
