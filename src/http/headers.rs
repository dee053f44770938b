//! Header storage and proxy header sanitization
//!
//! Headers are kept as an ordered list of name/value pairs so repeated
//! fields (`Set-Cookie`, `Vary`, ...) survive a trip through the proxy.
//! Lookups are case-insensitive; stored names keep their original casing.

/// Which way a header set is travelling through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client request headed to the internal endpoint
    Request,
    /// Internal endpoint response headed back to the client
    Response,
}

/// Headers meaningful only to a single connection
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Invalidated by the transport re-framing the decoded body
const RESPONSE_FRAMING: &[&str] = &["content-encoding", "content-length"];

/// Would stop the proxied UI from being embedded cross-origin
const FRAME_BLOCKING: &[&str] = &["x-frame-options", "content-security-policy"];

pub const CONTENT_SECURITY_POLICY: &str = "content-security-policy";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value for `name` with a single one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Strips headers that must not cross the proxy and, for responses,
/// rewrites framing policy so the internal UI can be embedded by the
/// configured origins.
#[derive(Debug, Clone)]
pub struct HeaderSanitizer {
    frame_policy: String,
}

impl HeaderSanitizer {
    /// `frame_ancestors` are the CSP sources allowed to frame responses.
    pub fn new<S: AsRef<str>>(frame_ancestors: &[S]) -> Self {
        let sources: Vec<&str> = frame_ancestors
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .collect();

        let frame_policy = if sources.is_empty() {
            "frame-ancestors 'none'".to_string()
        } else {
            format!("frame-ancestors {}", sources.join(" "))
        };

        Self { frame_policy }
    }

    pub fn frame_policy(&self) -> &str {
        &self.frame_policy
    }

    pub fn sanitize(&self, headers: &HeaderList, direction: Direction) -> HeaderList {
        let mut out: HeaderList = headers
            .iter()
            .filter(|(name, _)| !is_stripped(name, direction))
            .collect();

        if direction == Direction::Response {
            out.append(CONTENT_SECURITY_POLICY, self.frame_policy.clone());
        }

        out
    }
}

fn is_stripped(name: &str, direction: Direction) -> bool {
    let matches = |list: &[&str]| list.iter().any(|h| h.eq_ignore_ascii_case(name));

    match direction {
        Direction::Request => matches(HOP_BY_HOP),
        Direction::Response => {
            matches(HOP_BY_HOP) || matches(RESPONSE_FRAMING) || matches(FRAME_BLOCKING)
        }
    }
}
