use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Matching key for artist, album and song names.
///
/// Two names refer to the same entity when their keys are equal: surrounding
/// whitespace is dropped, internal runs collapse to one space, and case is
/// folded. "The  Beatles" and "the beatles" share a key; "Beatles" does not.
pub fn name_key(name: &str) -> String {
    WHITESPACE.replace_all(name.trim(), " ").to_lowercase()
}

/// Display form of a user-supplied name: trimmed, whitespace collapsed, case kept.
pub fn clean_name(name: &str) -> String {
    WHITESPACE.replace_all(name.trim(), " ").into_owned()
}
