//! Mention placeholder decoding and encoding.
//!
//! The transport carries a mention as a single placeholder character plus an
//! out-of-band `{offset, length, target}` record. Offsets are UTF-16 code
//! units.

use crate::types::{InboundMessage, Mention};
use dashmap::DashMap;
use std::collections::HashMap;
use uuid::Uuid;

pub const MENTION_PLACEHOLDER: char = '\u{FFFC}';

/// Identity → display name lookup.
pub trait IdentityDirectory: Send + Sync {
    fn display_name(&self, identity: &str) -> Option<String>;
}

impl IdentityDirectory for HashMap<String, String> {
    fn display_name(&self, identity: &str) -> Option<String> {
        self.get(identity).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionTarget {
    pub name: String,
    pub identity: String,
}

impl MentionTarget {
    pub fn new(name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: identity.into(),
        }
    }
}

/// Display names of non-bot senders, cached the first time they are seen.
#[derive(Debug, Default)]
pub struct ProfileCache {
    names: DashMap<String, String>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the identity was not known before.
    pub fn remember(&self, identity: &str, name: &str) -> bool {
        let name = name.trim();
        if identity.trim().is_empty() || name.is_empty() {
            return false;
        }
        self.names
            .insert(identity.to_string(), name.to_string())
            .is_none()
    }

    pub fn remember_sender(&self, message: &InboundMessage) -> bool {
        let Some(name) = message.source_name.as_deref() else {
            return false;
        };
        let mut first_seen = self.remember(&message.source_id, name);
        if let Some(alias) = message.source_alias.as_deref() {
            first_seen |= self.remember(alias, name);
        }
        first_seen
    }

    pub fn mention_targets(&self) -> Vec<MentionTarget> {
        self.names
            .iter()
            .filter(|entry| Uuid::parse_str(entry.key()).is_err())
            .map(|entry| MentionTarget::new(entry.value().clone(), entry.key().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl IdentityDirectory for ProfileCache {
    fn display_name(&self, identity: &str) -> Option<String> {
        self.names.get(identity).map(|name| name.value().clone())
    }
}

/// Replaces each placeholder with `@name`, working from the highest offset
/// down so earlier offsets stay valid. Unresolvable placeholders are removed.
pub fn decode_mentions(
    text: &str,
    mentions: &[Mention],
    directories: &[&dyn IdentityDirectory],
) -> String {
    let mut ordered: Vec<&Mention> = mentions.iter().collect();
    ordered.sort_by(|a, b| b.offset.cmp(&a.offset));

    let mut decoded = text.to_string();
    for mention in ordered {
        let start = utf16_to_byte_offset(&decoded, mention.offset);
        let end = utf16_to_byte_offset(&decoded, mention.offset + mention.length);
        let (Some(start), Some(end)) = (start, end) else {
            tracing::warn!(
                offset = mention.offset,
                length = mention.length,
                "mention range falls outside message text; skipping"
            );
            continue;
        };
        let replacement = resolve_label(mention, directories)
            .map(|name| format!("@{name}"))
            .unwrap_or_default();
        decoded.replace_range(start..end, &replacement);
    }
    decoded
}

fn resolve_label(mention: &Mention, directories: &[&dyn IdentityDirectory]) -> Option<String> {
    directories
        .iter()
        .find_map(|directory| directory.display_name(&mention.target))
        .or_else(|| {
            mention
                .label
                .as_deref()
                .map(str::trim)
                .filter(|label| !label.is_empty() && !looks_like_identity(label))
                .map(ToOwned::to_owned)
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedText {
    pub text: String,
    pub mentions: Vec<Mention>,
}

/// Replaces `@name` occurrences with placeholders. Longer names are matched
/// first so "@Ann Marie" never resolves as "@Ann".
pub fn encode_mentions(text: &str, targets: &[MentionTarget]) -> EncodedText {
    let mut ordered: Vec<&MentionTarget> = targets
        .iter()
        .filter(|target| !target.name.trim().is_empty())
        .collect();
    ordered.sort_by(|a, b| b.name.chars().count().cmp(&a.name.chars().count()));

    // ASCII lowercasing keeps byte offsets identical to `text`.
    let haystack = text.to_ascii_lowercase();
    let mut spans: Vec<(usize, usize, &str)> = Vec::new();
    for target in ordered {
        let needle = format!("@{}", target.name.to_ascii_lowercase());
        for (start, _) in haystack.match_indices(&needle) {
            let end = start + needle.len();
            if !is_leading_boundary(&text[..start]) || !is_trailing_boundary(&text[end..]) {
                continue;
            }
            if spans.iter().any(|&(s, e, _)| start < e && s < end) {
                continue;
            }
            spans.push((start, end, target.identity.as_str()));
        }
    }
    spans.sort_by_key(|&(start, _, _)| start);

    let mut encoded = String::with_capacity(text.len());
    let mut mentions = Vec::with_capacity(spans.len());
    let mut cursor = 0;
    for (start, end, identity) in spans {
        encoded.push_str(&text[cursor..start]);
        mentions.push(Mention {
            offset: utf16_len(&encoded),
            length: 1,
            target: identity.to_string(),
            label: None,
        });
        encoded.push(MENTION_PLACEHOLDER);
        cursor = end;
    }
    encoded.push_str(&text[cursor..]);

    EncodedText {
        text: encoded,
        mentions,
    }
}

fn is_leading_boundary(before: &str) -> bool {
    before
        .chars()
        .next_back()
        .is_none_or(|c| !c.is_alphanumeric())
}

fn is_trailing_boundary(after: &str) -> bool {
    after
        .chars()
        .next()
        .is_none_or(|c| c.is_whitespace() || c.is_ascii_punctuation())
}

pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Byte index for a UTF-16 offset; `None` when the offset splits a surrogate
/// pair or lies past the end.
pub fn utf16_to_byte_offset(text: &str, offset: usize) -> Option<usize> {
    let mut units = 0;
    for (index, c) in text.char_indices() {
        if units == offset {
            return Some(index);
        }
        if units > offset {
            return None;
        }
        units += c.len_utf16();
    }
    (units == offset).then_some(text.len())
}

/// UUIDs and phone numbers are identities, not names worth showing.
fn looks_like_identity(label: &str) -> bool {
    Uuid::parse_str(label).is_ok() || looks_like_phone_number(label)
}

fn looks_like_phone_number(label: &str) -> bool {
    let digits = label.strip_prefix('+').unwrap_or(label);
    digits.len() >= 5
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || c == ' ' || c == '-')
}
