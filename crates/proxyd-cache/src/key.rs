use http::Uri;
use percent_encoding::percent_decode;
use std::fmt;
use url::form_urlencoded;

/// Canonical identity of a cacheable request: the path plus its query
/// parameters, decoded, sorted by name and re-encoded.
///
/// Clients do not agree on parameter order (`?a=1&b=2` vs `?b=2&a=1`) or on
/// escaping (`%20` vs `+`), so the raw query string is never used directly.
/// Names and values are compared as raw bytes, so escapes that are not valid
/// UTF-8 stay distinct. A bare `?flag` and an empty `?flag=` are different
/// parameters and produce different keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

/// One decoded query parameter. `value` is `None` when the pair had no `=`.
type Param = (Vec<u8>, Option<Vec<u8>>);

impl CacheKey {
    /// Build a key from a path and an optional raw query string.
    pub fn new(path: &str, query: Option<&str>) -> Self {
        let mut params: Vec<Param> = query
            .map(|q| {
                q.split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((name, value)) => (decode(name), Some(decode(value))),
                        None => (decode(pair), None),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if params.is_empty() {
            return CacheKey(path.to_string());
        }

        // Stable: repeated names keep the order the client sent them in.
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let mut key = String::with_capacity(path.len() + 1 + query.map_or(0, str::len));
        key.push_str(path);
        for (i, (name, value)) in params.iter().enumerate() {
            key.push(if i == 0 { '?' } else { '&' });
            key.extend(form_urlencoded::byte_serialize(name));
            if let Some(value) = value {
                key.push('=');
                key.extend(form_urlencoded::byte_serialize(value));
            }
        }

        CacheKey(key)
    }

    pub fn from_uri(uri: &Uri) -> Self {
        Self::new(uri.path(), uri.query())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Percent-decode one name or value, with `+` standing for a space.
fn decode(raw: &str) -> Vec<u8> {
    let bytes: Vec<u8> = raw
        .bytes()
        .map(|b| if b == b'+' { b' ' } else { b })
        .collect();
    percent_decode(&bytes).collect()
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
