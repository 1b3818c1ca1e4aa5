//! Identity normalization.
//!
//! Feeds sometimes send rows with no serial. Those rows get a synthetic
//! identifier `PREFIX:TOKENS:INDEX`:
//!
//! - `PREFIX` is the feed's synthetic prefix (`FG-NOSN`, `STA-NOSN`, ...).
//! - `TOKENS` joins the normalized model, status code and grouping key with
//!   `_`, or is `UNKNOWN` when all three are blank.
//! - `INDEX` counts from 1 per (feed, grouping key) within one [`RunContext`],
//!   skipping any value that would repeat an identifier already issued. Keys
//!   such as `L-1` and `L1`, or long loads sharing their first twelve
//!   characters, collapse to one token and would otherwise collide.
//!
//! Synthetic identifiers are recognizable from the string alone
//! ([`is_synthetic`]); nothing else records which identifiers were invented.

use std::collections::{HashMap, HashSet};

use stockline_db::{NewSourceRecord, SourceType};

use crate::fields::RawFeedRow;

/// Longest token kept per fallback attribute.
pub const MAX_TOKEN_LEN: usize = 12;

/// Token used when every fallback attribute is blank.
pub const UNKNOWN_TOKEN: &str = "UNKNOWN";

/// Uppercase, keep ASCII alphanumerics only, truncate to [`MAX_TOKEN_LEN`].
#[must_use]
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .take(MAX_TOKEN_LEN)
        .collect()
}

/// Trim and uppercase a natural serial. Blank serials are absent.
#[must_use]
pub fn normalize_serial(raw: &str) -> Option<String> {
    let serial = raw.trim().to_uppercase();
    (!serial.is_empty()).then_some(serial)
}

/// Whether `identifier` was produced by [`RunContext::synthesize`].
#[must_use]
pub fn is_synthetic(identifier: &str) -> bool {
    let mut parts = identifier.split(':');
    let (Some(prefix), Some(tokens), Some(index), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    SourceType::from_synthetic_prefix(prefix).is_some()
        && !tokens.is_empty()
        && !index.is_empty()
        && index.bytes().all(|b| b.is_ascii_digit())
        && index.parse::<u32>().is_ok_and(|n| n > 0)
}

/// Per-invocation identity state.
///
/// Constructed fresh for every ingestion batch so concurrent batches never
/// share counters.
#[derive(Debug, Default)]
pub struct RunContext {
    synthesized: u64,
    duplicates: u64,
    indexes: HashMap<(SourceType, String), u32>,
    issued: HashSet<String>,
    seen: HashSet<(SourceType, String)>,
}

impl RunContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of synthetic identifiers issued so far.
    #[must_use]
    pub fn synthesized_count(&self) -> u64 {
        self.synthesized
    }

    /// Number of rows dropped because their identifier was already emitted.
    #[must_use]
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }

    /// Issue the next synthetic identifier for a row without a serial.
    pub fn synthesize(
        &mut self,
        source_type: SourceType,
        model: Option<&str>,
        status_code: Option<&str>,
        grouping_key: Option<&str>,
    ) -> String {
        let tokens: Vec<String> = [model, status_code, grouping_key]
            .into_iter()
            .flatten()
            .map(normalize_token)
            .filter(|token| !token.is_empty())
            .collect();
        let tokens = if tokens.is_empty() {
            UNKNOWN_TOKEN.to_string()
        } else {
            tokens.join("_")
        };

        let group = grouping_key.map(str::trim).unwrap_or_default().to_string();
        let index = self.indexes.entry((source_type, group)).or_insert(0);
        let identifier = loop {
            *index += 1;
            let candidate = format!("{}:{}:{}", source_type.synthetic_prefix(), tokens, index);
            if !self.issued.contains(&candidate)
                && !self.seen.contains(&(source_type, candidate.clone()))
            {
                break candidate;
            }
        };

        self.issued.insert(identifier.clone());
        self.synthesized += 1;
        identifier
    }

    /// Turn a resolved feed row into a source record.
    ///
    /// Returns `None` when the row's identifier was already emitted for the
    /// same feed in this context; the duplicate is counted, not reported.
    pub fn normalize(&mut self, source_type: SourceType, row: RawFeedRow) -> Option<NewSourceRecord> {
        let identifier = match row.serial.as_deref().and_then(normalize_serial) {
            Some(serial) => serial,
            None => self.synthesize(
                source_type,
                row.model.as_deref(),
                row.status_code.as_deref(),
                row.grouping_key.as_deref(),
            ),
        };

        if !self.seen.insert((source_type, identifier.clone())) {
            self.duplicates += 1;
            tracing::debug!(
                source_type = %source_type,
                identifier = %identifier,
                "Dropping duplicate identifier in feed batch"
            );
            return None;
        }

        Some(NewSourceRecord {
            source_type,
            identifier,
            bucket: row.bucket,
            state: row.state,
            model: row.model,
            quantity: row.quantity,
            grouping_key: row.grouping_key,
            status_code: row.status_code,
            message_code: row.message_code,
            last_seen_at: row.last_seen_at,
            raw_payload: row.raw,
        })
    }
}
