//! GC-aware Ajax URLs.
//!
//! With GC enabled the server wants to know which page a request belongs to
//! and how busy the client is, so the ajax path segment is rewritten:
//!
//! ```text
//! /lift/ajax/            ->  /lift/ajax/<page>-<version36><depth36>/
//! ```
//!
//! Requests without a version (JSON calls, keep-alives) only get the page.

use super::queue::{AjaxVersion, MAX_REPORTED_DEPTH};

/// Render `value` in lowercase base 36.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Rewrite `url` for the server's GC bookkeeping.
///
/// `ajax_path` is the mount point being rewritten (`/lift/ajax`), `queued`
/// the number of requests still waiting. Returns `url` untouched when GC is
/// off.
pub fn calc_ajax_url(
    url: &str,
    ajax_path: &str,
    page_id: &str,
    version: Option<AjaxVersion>,
    queued: usize,
    gc_enabled: bool,
) -> String {
    if !gc_enabled {
        return url.to_string();
    }

    let mut replacement = format!("{ajax_path}/{page_id}");
    if let Some(version) = version {
        replacement.push('-');
        replacement.push_str(&to_base36(version.get()));
        replacement.push_str(&to_base36(queued.min(MAX_REPORTED_DEPTH) as u64));
    }

    url.replacen(ajax_path, &replacement, 1)
}
