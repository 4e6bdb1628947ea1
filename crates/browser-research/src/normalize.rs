//! URL and query normalisation shared by cache keys, origins and dedup.

use url::Url;

/// Normalise a URL: default `https` scheme, lowercase scheme and host,
/// collapsed duplicate slashes, no trailing slash (except root), no fragment.
pub fn normalize_url(raw: &str) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim();
    let mut url = if trimmed.contains("://") {
        Url::parse(trimmed)?
    } else {
        Url::parse(&format!("https://{trimmed}"))?
    };

    let mut path = String::with_capacity(url.path().len());
    let mut prev_slash = false;
    for c in url.path().chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        path.push(c);
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    url.set_path(&path);
    url.set_fragment(None);
    Ok(url)
}

/// Normalise a free-text query: trimmed, lowercased, single-spaced.
pub fn normalize_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `scheme://host[:port]` of a URL.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Whether the URL is something a page fetch can load (`http` or `https`).
pub fn is_web_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}
