//! Whitespace and comment stripping for stylesheets and scripts.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

static CSS_COMMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/\*([^*]|[\r\n]|(\*+([^*/]|[\r\n])))*\*+/").expect("css comment regex")
});

/// Drop `/* … */` comments, trim every line and join the lines.
pub fn minify_css(source: &[u8]) -> String {
    let stripped = CSS_COMMENT.replace_all(source, &b""[..]);
    String::from_utf8_lossy(&stripped)
        .lines()
        .map(str::trim)
        .collect()
}

/// Trim every line and drop blank lines and whole-line `//` comments.
///
/// Line breaks are kept so automatic semicolon insertion still applies.
pub fn minify_js(source: &[u8]) -> String {
    let text = String::from_utf8_lossy(source);
    let mut out = String::with_capacity(text.len());
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
