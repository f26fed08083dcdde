//! Product URL canonicalization
//!
//! Equal products must map to equal canonical URLs, so the rules here are
//! deliberately aggressive: tracking parameters are dropped, the remaining
//! query is sorted, and cosmetic differences (case, default ports, duplicate
//! slashes, fragments) are erased. The product fingerprint is the MD5 of the
//! canonical URL and is the dedupe key everywhere else in the crate.

use url::Url;

/// Checks whether a query parameter name matches a blacklist pattern.
///
/// Patterns are either literal names (`"ref"`) or `*`-suffix globs
/// (`"utm_*"` matches `utm_source`, `utm_campaign`, ...).
pub fn param_matches_blacklist(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix('*') {
            name.starts_with(prefix)
        } else {
            name == pattern
        }
    })
}

/// Canonicalizes a product URL.
///
/// # Normalization Steps
///
/// 1. Resolve `raw` against `base` (relative hrefs become absolute)
/// 2. Lowercase the scheme and host
/// 3. Strip default ports (80 for http, 443 for https)
/// 4. Collapse duplicate slashes in the path
/// 5. Remove the fragment
/// 6. Drop query parameters matching the dedupe blacklist
/// 7. Sort the remaining query parameters by name
///
/// The function is pure and idempotent: `canonicalize_url(canonical, ...)`
/// returns the same string again.
///
/// # Arguments
///
/// * `raw` - The raw href as extracted from the page
/// * `base` - Base URL for resolving relative links (the category's site)
/// * `strip_params` - Dedupe blacklist patterns (literal or `*`-suffix glob)
///
/// # Returns
///
/// * `Ok(String)` - The canonical absolute URL
/// * `Err(url::ParseError)` - `raw` could not be parsed even against `base`
pub fn canonicalize_url(
    raw: &str,
    base: Option<&str>,
    strip_params: &[String],
) -> Result<String, url::ParseError> {
    let mut url = match base {
        Some(base) => Url::parse(base)?.join(raw)?,
        None => Url::parse(raw)?,
    };

    // Url::parse already lowercases scheme and host and drops default ports,
    // so only the path and query need handling here.
    let collapsed = collapse_slashes(url.path());
    if collapsed != url.path() {
        url.set_path(&collapsed);
    }

    url.set_fragment(None);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !param_matches_blacklist(name, strip_params))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    if params.is_empty() {
        url.set_query(None);
    } else {
        params.sort();
        let query = params
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name.clone()
                } else {
                    format!("{}={}", name, value)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

/// Computes the product fingerprint: MD5 of the canonical URL, lowercase hex.
pub fn fingerprint(canonical: &str) -> String {
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// Collapses runs of `/` in a path into a single slash
fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    out
}
