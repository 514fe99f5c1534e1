//! Session path normalization.
//!
//! Chat references may hold absolute URLs (`https://host/c/abc?model=x`),
//! root-relative paths (`/c/abc/`) or nothing at all (a provisional entry
//! whose session does not exist yet). Everything that compares sessions goes
//! through [`normalize_path`].

use url::Url;

/// Origin used to resolve relative references. Only the path survives.
const RESOLVE_BASE: &str = "https://host.invalid/";

/// Title used when the host renders a session without any text.
pub const DEFAULT_TITLE: &str = "New chat";

/// Resolve a raw url or path to its normalized session path.
///
/// Returns `None` for empty, unparsable, or non-http references (such as
/// `javascript:void 0` placeholders).
pub fn normalize_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let base = Url::parse(RESOLVE_BASE).ok()?;
    let url = base.join(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let path = url.path();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        Some("/".to_string())
    } else {
        Some(trimmed.to_string())
    }
}

/// True when both references resolve to the same session path.
pub fn same_session(a: &str, b: &str) -> bool {
    match (normalize_path(a), normalize_path(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// True for paths that address a concrete conversation (`/c/<id>`, including
/// conversations nested under a project such as `/g/<project>/c/<id>`).
pub fn is_session_path(path: &str) -> bool {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "c" {
            return segments.next().is_some();
        }
    }
    false
}

/// Trim a displayed title, substituting [`DEFAULT_TITLE`] when blank.
pub fn display_title(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_TITLE
    } else {
        trimmed
    }
}
