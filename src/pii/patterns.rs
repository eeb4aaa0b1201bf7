//! Pattern tables and checksum validators for the PII scanner.
//!
//! Matchers run in a fixed order, cheapest and most discriminating first.
//! Candidates for checksum-bearing kinds (credit card, IBAN) must pass
//! their checksum before they claim a span. Phone matchers run last and
//! must not claim a span already taken by another kind.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Kind;

/// Compiles a pattern known valid at authoring time.
fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => unreachable!("catalogue pattern failed to compile: {e}"),
    }
}

static EMAIL: Lazy<Regex> =
    Lazy::new(|| compile(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,63}"));

static SSN: Lazy<Regex> = Lazy::new(|| compile(r"\b\d{3}-\d{2}-\d{4}\b"));

static IBAN: Lazy<Regex> = Lazy::new(|| compile(r"\b[A-Z]{2}\d{2}[A-Za-z0-9]{10,30}\b"));

static NATIONAL_ID: Lazy<Regex> = Lazy::new(|| compile(r"\b[1-9]\d{10}\b"));

static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| compile(r"\b\d(?:[ -]?\d){12,18}\b"));

static PHONE_INTL: Lazy<Regex> =
    Lazy::new(|| compile(r"\+[1-9]\d{0,2}[ .-]?(?:\d[ .-]?){6,12}\d"));

static PHONE_NATIONAL: Lazy<Regex> =
    Lazy::new(|| compile(r"\b(?:\(0?\d{2,4}\)|0\d{1,4})[ .-]?\d{3,4}[ .-]?\d{3,4}\b"));

/// A candidate span claimed by one matcher, in byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct RawMatch {
    pub kind: Kind,
    pub start: usize,
    pub end: usize,
}

impl RawMatch {
    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Luhn checksum over the digits of a candidate.
///
/// Non-digit separators are ignored; 13–19 digits are accepted.
#[must_use]
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// ISO 13616 mod-97 check for an IBAN candidate.
///
/// The candidate must already match the IBAN shape (two letters, two
/// check digits, alphanumeric BBAN). Letters map to 10–35; the rearranged
/// number must be ≡ 1 (mod 97). Computed incrementally to avoid bignums.
#[must_use]
pub fn iban_valid(candidate: &str) -> bool {
    if candidate.len() < 15 || candidate.len() > 34 {
        return false;
    }
    let rearranged = candidate
        .chars()
        .skip(4)
        .chain(candidate.chars().take(4));
    let mut remainder: u32 = 0;
    for c in rearranged {
        let value = match c {
            '0'..='9' => u32::from(c) - u32::from('0'),
            'A'..='Z' => u32::from(c) - u32::from('A') + 10,
            'a'..='z' => u32::from(c) - u32::from('a') + 10,
            _ => return false,
        };
        remainder = if value < 10 {
            (remainder * 10 + value) % 97
        } else {
            (remainder * 100 + value) % 97
        };
    }
    remainder == 1
}

/// Area/group/serial plausibility for a formatted SSN candidate.
fn ssn_plausible(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    let (Some(area), Some(group), Some(serial)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    area != "000" && area != "666" && area < "900" && group != "00" && serial != "0000"
}

/// Runs every matcher over one window, returning claimed spans.
///
/// Offsets are relative to the window start; the caller rebases them.
/// Phones are rejected when they overlap a span claimed by any earlier
/// kind.
pub(super) fn scan_window(text: &str) -> Vec<RawMatch> {
    let mut claimed: Vec<RawMatch> = Vec::new();

    for m in EMAIL.find_iter(text) {
        claimed.push(RawMatch {
            kind: Kind::Email,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in SSN.find_iter(text) {
        if ssn_plausible(m.as_str()) {
            claimed.push(RawMatch {
                kind: Kind::Ssn,
                start: m.start(),
                end: m.end(),
            });
        }
    }
    for m in IBAN.find_iter(text) {
        if iban_valid(m.as_str()) {
            claimed.push(RawMatch {
                kind: Kind::Iban,
                start: m.start(),
                end: m.end(),
            });
        }
    }
    for m in NATIONAL_ID.find_iter(text) {
        // A '+' immediately before the digits marks a dialing prefix, not
        // an identity number; leave the span for the phone matchers.
        if text[..m.start()].ends_with('+') {
            continue;
        }
        let span = RawMatch {
            kind: Kind::NationalId,
            start: m.start(),
            end: m.end(),
        };
        if !claimed.iter().any(|c| c.overlaps(&span)) {
            claimed.push(span);
        }
    }
    for m in CREDIT_CARD.find_iter(text) {
        if luhn_valid(m.as_str()) {
            let span = RawMatch {
                kind: Kind::CreditCard,
                start: m.start(),
                end: m.end(),
            };
            if !claimed.iter().any(|c| c.overlaps(&span)) {
                claimed.push(span);
            }
        }
    }
    for (regex, kind) in [
        (&*PHONE_INTL, Kind::PhoneIntl),
        (&*PHONE_NATIONAL, Kind::PhoneNational),
    ] {
        for m in regex.find_iter(text) {
            let span = RawMatch {
                kind,
                start: m.start(),
                end: m.end(),
            };
            // Phones never take a span another kind already claimed.
            if !claimed.iter().any(|c| c.overlaps(&span)) {
                claimed.push(span);
            }
        }
    }

    claimed
}
