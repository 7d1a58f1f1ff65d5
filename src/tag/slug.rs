//! Name normalization for tags and object names
//!
//! Both slug forms are stable: an input that is already valid is returned
//! unchanged, anything else is normalized and suffixed with a short hash of
//! the original so that distinct inputs stay distinct.

use sha2::{Digest, Sha256};

/// Max length of a DNS-label style slug
pub const SLUG_MAX_LEN: usize = 42;

/// Max length of a docker tag
pub const DOCKER_TAG_MAX_LEN: usize = 128;

const HASH_LEN: usize = 8;

fn short_hash(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))[..HASH_LEN].to_string()
}

fn with_hash(head: &str, original: &str, max_len: usize) -> String {
    let hash = short_hash(original);
    let room = max_len - HASH_LEN - 1;
    let head: String = head.chars().take(room).collect();
    let head = head.trim_end_matches(['-', '.']);
    if head.is_empty() {
        hash
    } else {
        format!("{}-{}", head, hash)
    }
}

/// Lowercase `[a-z0-9-]` slug of at most 42 chars
pub fn slug(value: &str) -> String {
    let mut normalized = String::with_capacity(value.len());
    for c in value.chars() {
        let mapped = match c {
            'a'..='z' | '0'..='9' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        };
        if mapped == '-' && normalized.ends_with('-') {
            continue;
        }
        normalized.push(mapped);
    }
    let normalized = normalized.trim_matches('-');

    if normalized == value && value.len() <= SLUG_MAX_LEN {
        return value.to_string();
    }
    with_hash(normalized, value, SLUG_MAX_LEN)
}

/// Docker-tag-safe slug of at most 128 chars
pub fn safe_slug(value: &str) -> String {
    let normalized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let normalized = normalized.trim_start_matches(['-', '.']);

    if normalized == value && validate_docker_tag(value).is_ok() {
        return value.to_string();
    }
    with_hash(normalized, value, DOCKER_TAG_MAX_LEN)
}

/// Check `tag` against docker tag rules
pub fn validate_docker_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("tag is empty".to_string());
    }
    if tag.len() > DOCKER_TAG_MAX_LEN {
        return Err(format!(
            "tag is {} characters long, the limit is {}",
            tag.len(),
            DOCKER_TAG_MAX_LEN
        ));
    }

    let mut chars = tag.chars();
    if let Some(first) = chars.next() {
        if !(first.is_ascii_alphanumeric() || first == '_') {
            return Err(format!("tag {:?} must start with a letter, digit or underscore", tag));
        }
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))) {
        return Err(format!("tag {:?} contains invalid character {:?}", tag, bad));
    }
    Ok(())
}
