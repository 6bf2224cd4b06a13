//! MIME hints attached to ready sidecars.

/// Best-effort MIME type from a path's extension.
pub fn from_path(rel: &str) -> Option<String> {
    mime_guess::from_path(rel)
        .first()
        .map(|m| m.essence_str().to_owned())
}

/// Normalize a `Content-Type` header value to its essence
/// (`"text/html; charset=utf-8"` becomes `"text/html"`).
pub fn essence(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    if essence.is_empty() || !essence.contains('/') {
        return None;
    }
    Some(essence)
}

/// Known extensions (without dot) for a MIME type.
pub fn extensions(mime: &str) -> &'static [&'static str] {
    mime_guess::get_mime_extensions_str(mime).unwrap_or(&[])
}

/// Whether `name` already carries one of the extensions registered for `mime`.
pub fn has_extension_for(name: &str, mime: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    extensions(mime)
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}
