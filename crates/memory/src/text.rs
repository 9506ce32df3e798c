//! Token helpers shared by the store backends.

use std::collections::HashMap;

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

pub(crate) fn overlap(query: &[String], content: &str) -> usize {
    let tokens = tokenize(content);
    query.iter().filter(|q| tokens.contains(q)).count()
}

/// The longest token over 4 chars — the grouping key for clustering.
pub(crate) fn dominant_token(content: &str) -> Option<String> {
    tokenize(content)
        .into_iter()
        .filter(|t| t.len() > 4)
        .max_by_key(|t| t.len())
}

/// Group fact contents by dominant token; only groups of `min_size` or
/// more survive.
pub(crate) fn group_by_dominant(
    contents: impl Iterator<Item = String>,
    min_size: usize,
) -> HashMap<String, Vec<String>> {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for content in contents {
        if let Some(key) = dominant_token(&content) {
            groups.entry(key).or_default().push(content);
        }
    }
    groups.retain(|_, members| members.len() >= min_size);
    groups
}
