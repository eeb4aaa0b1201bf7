//! PII detection and redaction.
//!
//! A pure scanner over opaque text: no network, no file I/O, byte-for-byte
//! deterministic. A fixed catalogue of regulated identifiers is matched in
//! a fixed order; checksum-bearing kinds (credit card, IBAN) must pass
//! their checksum; overlapping matches resolve to the earlier start, then
//! the longer span. Inputs above 1 MiB are scanned in 64 KiB sliding
//! windows with a 64-byte overlap so cross-boundary matches still land.

mod patterns;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use patterns::{iban_valid, luhn_valid};

/// Inputs above this size are scanned in sliding windows.
const WINDOW_BOUND: usize = 1024 * 1024;
/// Window size for oversized inputs.
const WINDOW_SIZE: usize = 64 * 1024;
/// Overlap between adjacent windows, sized for the longest match.
const WINDOW_OVERLAP: usize = 64;

/// Catalogue of regulated identifier kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// RFC-5322-shaped email address.
    Email,
    /// International (E.164-prefixed) phone number.
    PhoneIntl,
    /// National-format phone number.
    PhoneNational,
    /// IBAN passing the mod-97 check.
    Iban,
    /// Payment card number passing the Luhn check.
    CreditCard,
    /// National identity number.
    NationalId,
    /// US social security number.
    Ssn,
}

impl Kind {
    /// Stable lowercase label used in redaction markers and telemetry.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::PhoneIntl => "phone_intl",
            Self::PhoneNational => "phone_national",
            Self::Iban => "iban",
            Self::CreditCard => "credit_card",
            Self::NationalId => "national_id",
            Self::Ssn => "ssn",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A resolved match with byte offsets into the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    /// Which identifier kind matched.
    pub kind: Kind,
    /// Byte offset of the first matched byte.
    pub start: usize,
    /// Byte offset one past the last matched byte.
    pub end: usize,
}

/// Scans text and returns every resolved match, ordered by start offset.
///
/// Matches never overlap: where candidates collide, the earlier start
/// wins, then the longer span.
#[must_use]
pub fn scan(text: &str) -> Vec<Match> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut raw: Vec<patterns::RawMatch> = Vec::new();
    if text.len() <= WINDOW_BOUND {
        raw.extend(patterns::scan_window(text));
    } else {
        let mut seen: BTreeSet<(usize, usize, Kind)> = BTreeSet::new();
        let mut start = 0usize;
        while start < text.len() {
            let mut end = (start + WINDOW_SIZE).min(text.len());
            while end < text.len() && !text.is_char_boundary(end) {
                end += 1;
            }
            for m in patterns::scan_window(&text[start..end]) {
                let global = (start + m.start, start + m.end, m.kind);
                if seen.insert(global) {
                    raw.push(patterns::RawMatch {
                        kind: m.kind,
                        start: global.0,
                        end: global.1,
                    });
                }
            }
            if end == text.len() {
                break;
            }
            let mut next = end - WINDOW_OVERLAP.min(end);
            while next > 0 && !text.is_char_boundary(next) {
                next -= 1;
            }
            // Guarantee forward progress even for pathological boundaries.
            start = next.max(start + 1);
        }
    }

    resolve_overlaps(raw)
}

/// Resolves overlapping candidates: earlier start wins, then longer span.
fn resolve_overlaps(mut raw: Vec<patterns::RawMatch>) -> Vec<Match> {
    raw.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| b.end.cmp(&a.end))
            .then_with(|| a.kind.cmp(&b.kind))
    });
    let mut resolved: Vec<Match> = Vec::with_capacity(raw.len());
    let mut claimed_end = 0usize;
    for m in raw {
        if m.start >= claimed_end {
            resolved.push(Match {
                kind: m.kind,
                start: m.start,
                end: m.end,
            });
            claimed_end = m.end;
        }
    }
    resolved
}

/// Whether any regulated identifier is present.
#[must_use]
pub fn detect(text: &str) -> bool {
    !scan(text).is_empty()
}

/// The set of identifier kinds present in the text.
#[must_use]
pub fn detect_detail(text: &str) -> BTreeSet<Kind> {
    scan(text).into_iter().map(|m| m.kind).collect()
}

/// Validates raw bytes as text, then detects.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] when the bytes are not valid UTF-8.
/// Pattern absence is a normal `false` result, not an error.
pub fn detect_bytes(bytes: &[u8]) -> Result<bool> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::MalformedInput {
        message: format!("input is not valid UTF-8 at byte {}", e.valid_up_to()),
    })?;
    Ok(detect(text))
}

/// Replaces every matched span with `[REDACTED:<kind>]`.
///
/// Idempotent: redacting already-redacted text changes nothing, because
/// the markers match no catalogue pattern.
#[must_use]
pub fn redact(text: &str) -> String {
    redact_with(text, "[REDACTED:<kind>]")
}

/// Replaces matched spans with `replacement`, substituting `<kind>` with
/// the matched kind's label.
#[must_use]
pub fn redact_with(text: &str, replacement: &str) -> String {
    let matches = scan(text);
    if matches.is_empty() {
        return text.to_string();
    }
    let mut out = text.to_string();
    for m in matches.iter().rev() {
        let marker = replacement.replace("<kind>", m.kind.label());
        out.replace_range(m.start..m.end, &marker);
    }
    out
}
