use std::sync::LazyLock;

use regex::Regex;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip HTML tags from surrounding page context and collapse whitespace.
///
/// Uploads carry the text around the image as it appeared in the document,
/// so markup has to go before the text reaches the model or the database.
pub fn clean_context(raw: &str) -> String {
    let stripped = TAG_RE.replace_all(raw, " ");
    WS_RE.replace_all(&stripped, " ").trim().to_string()
}
