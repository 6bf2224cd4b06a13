//! File-name resolution for downloaded resources.

use percent_encoding::percent_decode_str;

/// Characters that cannot appear in a stored file name. `%` and `#` are
/// reserved by the sidecar naming scheme.
const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '%', '#'];

const FALLBACK_NAME: &str = "download";

/// Extract the `filename` parameter of a `Content-Disposition` header,
/// trimming quotes and percent-decoding it. Supports the RFC 5987
/// `filename*=UTF-8''...` form when no plain `filename` is present.
pub fn from_content_disposition(header: &str) -> Option<String> {
    let mut extended = None;
    for param in header.split(';') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if key.eq_ignore_ascii_case("filename") {
            return decoded(value);
        }
        if key.eq_ignore_ascii_case("filename*") {
            let value = value.rsplit_once('\'').map_or(value, |(_, v)| v);
            extended = decoded(value);
        }
    }
    extended
}

/// Last path segment of `url`, with query and fragment stripped.
pub fn from_url(url: &str) -> Option<String> {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    // First segment is the authority.
    let (_, path) = path.split_once('/')?;
    decoded(path.rsplit('/').next()?)
}

/// Replace characters a stored file name may not contain.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if INVALID.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_owned();
    match cleaned.as_str() {
        "" | "." | ".." => FALLBACK_NAME.to_owned(),
        _ => cleaned,
    }
}

/// Pick the best name for a response: header first, then the URL tail.
pub fn resolve(content_disposition: Option<&str>, url: &str) -> String {
    let raw = content_disposition
        .and_then(from_content_disposition)
        .or_else(|| from_url(url))
        .unwrap_or_default();
    sanitize(&raw)
}

fn decoded(raw: &str) -> Option<String> {
    let name = percent_decode_str(raw.trim()).decode_utf8_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}
