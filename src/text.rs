//! Plain-text normalization applied to fetched content before it is stored or
//! diffed, so that platform noise does not show up as edits.
use once_cell::sync::Lazy;
use regex::Regex;

static ZERO_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\u{200B}\u{200C}\u{200D}\u{2060}\u{FEFF}]").expect("valid regex"));
static ODD_SPACES: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\u{00A0}\u{2007}\u{202F}]").expect("valid regex"));
static TRAILING_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)[ \t]+$").expect("valid regex"));

/// Normalize line endings, drop zero-width characters, turn non-breaking
/// spaces into plain spaces and trim trailing whitespace on every line.
pub fn normalize(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n").replace('\r', "\n");
    let text = ZERO_WIDTH.replace_all(&text, "");
    let text = ODD_SPACES.replace_all(&text, " ");
    let text = TRAILING_WS.replace_all(&text, "");
    text.trim_end_matches('\n').to_string()
}
