// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscript collation.
//!
//! MUMPS orders subscripts with canonical numbers first (numerically), then
//! strings (byte order). [`Subscript`] implements that order through `Ord`,
//! and [`Subscript::collation_key`] produces a byte encoding whose `memcmp`
//! order is the same, so ordered stores (a `BTreeMap`, a SQL `BLOB` index)
//! can range-scan a level without knowing anything about MUMPS.
//!
//! # Key layout
//!
//! ```text
//! negative number   0x10  !(exponent:u32be  digits...  0x00)
//! zero              0x11
//! positive number   0x12   exponent:u32be  digits...  0x00
//! string            0x20   bytes (0x00 → 0x00 0xFF)   0x00 0x00
//! ```
//!
//! Every encoding is self-delimiting and starts with a tag below `0xFF`, so
//! all descendants of an address live in `[key, key ++ 0xFF)`.

use std::cmp::Ordering;
use std::fmt;

const TAG_NEGATIVE: u8 = 0x10;
const TAG_ZERO: u8 = 0x11;
const TAG_POSITIVE: u8 = 0x12;
const TAG_TEXT: u8 = 0x20;

/// Upper sentinel byte: greater than every subscript tag.
pub const KEY_UPPER_SENTINEL: u8 = 0xFF;

const EXPONENT_BIAS: i64 = 1 << 31;

/// A number in MUMPS canonical form.
///
/// Canonical means: no leading zeros in the integer part, no trailing zeros
/// in the fraction, no trailing `.`, no `+`, `-0` is not canonical, and a
/// leading `0` before the point is dropped (`.5`, not `0.5`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalNumber {
    text: String,
    negative: bool,
    int_digits: String,
    frac_digits: String,
}

impl CanonicalNumber {
    /// Parse `s` if it is already a canonical number.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s == "0" {
            return Some(Self {
                text: s.to_string(),
                negative: false,
                int_digits: String::new(),
                frac_digits: String::new(),
            });
        }

        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if body.is_empty() {
            return None;
        }

        let (int_part, frac_part) = match body.split_once('.') {
            Some((int_part, frac_part)) => (int_part, Some(frac_part)),
            None => (body, None),
        };

        if !int_part.bytes().all(|b| b.is_ascii_digit()) || int_part.starts_with('0') {
            return None;
        }
        if let Some(frac) = frac_part {
            if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) || frac.ends_with('0') {
                return None;
            }
        } else if int_part.is_empty() {
            return None;
        }

        Some(Self {
            text: s.to_string(),
            negative,
            int_digits: int_part.to_string(),
            frac_digits: frac_part.unwrap_or_default().to_string(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.int_digits.is_empty() && self.frac_digits.is_empty()
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    fn cmp_magnitude(&self, other: &Self) -> Ordering {
        self.int_digits
            .len()
            .cmp(&other.int_digits.len())
            .then_with(|| self.int_digits.cmp(&other.int_digits))
            .then_with(|| self.frac_digits.cmp(&other.frac_digits))
    }

    /// Scientific form `0.d1d2… × 10^exponent` with `d1 != 0`.
    fn normalized(&self) -> (i64, Vec<u8>) {
        let all: Vec<u8> = self
            .int_digits
            .bytes()
            .chain(self.frac_digits.bytes())
            .map(|b| b - b'0')
            .collect();

        let (exponent, mut digits) = if self.int_digits.is_empty() {
            let leading = all.iter().take_while(|&&d| d == 0).count();
            (-(leading as i64), all[leading..].to_vec())
        } else {
            (self.int_digits.len() as i64, all)
        };

        while digits.last() == Some(&0) {
            digits.pop();
        }
        (exponent, digits)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        if self.is_zero() {
            out.push(TAG_ZERO);
            return;
        }

        let (exponent, digits) = self.normalized();
        let mut body = Vec::with_capacity(digits.len() + 5);
        body.extend_from_slice(&((exponent + EXPONENT_BIAS) as u32).to_be_bytes());
        body.extend(digits.iter().map(|d| d + 1));
        body.push(0x00);

        if self.negative {
            out.push(TAG_NEGATIVE);
            out.extend(body.iter().map(|b| !b));
        } else {
            out.push(TAG_POSITIVE);
            out.extend(body);
        }
    }
}

impl Ord for CanonicalNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = |n: &Self| -> i8 {
            if n.is_zero() {
                0
            } else if n.negative {
                -1
            } else {
                1
            }
        };

        match rank(self).cmp(&rank(other)) {
            Ordering::Equal => match rank(self) {
                0 => Ordering::Equal,
                1 => self.cmp_magnitude(other),
                _ => other.cmp_magnitude(self),
            },
            unequal => unequal,
        }
    }
}

impl PartialOrd for CanonicalNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One element of a global address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscript {
    Number(CanonicalNumber),
    Text(String),
}

impl Subscript {
    /// Classify `s`: canonical numbers collate numerically, everything else
    /// as a string.
    pub fn parse(s: impl Into<String>) -> Self {
        let s = s.into();
        match CanonicalNumber::parse(&s) {
            Some(number) => Self::Number(number),
            None => Self::Text(s),
        }
    }

    /// The empty string subscript, used as the "before first" cursor for `order`.
    #[must_use]
    pub fn empty() -> Self {
        Self::Text(String::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Text(s) if s.is_empty())
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Text form, as stored or passed to a backing engine.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Number(n) => n.as_str(),
            Self::Text(s) => s,
        }
    }

    /// Order-preserving, self-delimiting byte encoding.
    #[must_use]
    pub fn collation_key(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Number(n) => n.encode_into(out),
            Self::Text(s) => {
                out.push(TAG_TEXT);
                escape_text_into(s, out);
                out.extend_from_slice(&[0x00, 0x00]);
            }
        }
    }
}

/// Escaped text bytes without tag or terminator. Used for prefix range scans.
pub(crate) fn escape_text_into(s: &str, out: &mut Vec<u8>) {
    for b in s.bytes() {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
}

/// Lower bound of every text subscript starting with `prefix`.
pub(crate) fn text_prefix_key(prefix: &str) -> Vec<u8> {
    let mut out = vec![TAG_TEXT];
    escape_text_into(prefix, &mut out);
    out
}

impl Ord for Subscript {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.cmp(b),
            (Self::Number(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Number(_)) => Ordering::Greater,
            (Self::Text(a), Self::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
        }
    }
}

impl PartialOrd for Subscript {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Subscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n.as_str()),
            Self::Text(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
        }
    }
}

impl From<&str> for Subscript {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Subscript {
    fn from(s: String) -> Self {
        Self::parse(s)
    }
}

impl From<&String> for Subscript {
    fn from(s: &String) -> Self {
        Self::parse(s.as_str())
    }
}

impl From<i64> for Subscript {
    fn from(n: i64) -> Self {
        Self::parse(n.to_string())
    }
}

impl From<u64> for Subscript {
    fn from(n: u64) -> Self {
        Self::parse(n.to_string())
    }
}

impl From<i32> for Subscript {
    fn from(n: i32) -> Self {
        Self::parse(n.to_string())
    }
}

impl From<u32> for Subscript {
    fn from(n: u32) -> Self {
        Self::parse(n.to_string())
    }
}

impl From<&Subscript> for Subscript {
    fn from(s: &Subscript) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(s: &str) -> Subscript {
        Subscript::parse(s)
    }

    #[test]
    fn test_canonical_numbers() {
        for s in ["0", "1", "-1", "42", "1.5", ".5", "-.5", "-12.25", "100", "123456789012345678901234567890"] {
            assert!(CanonicalNumber::parse(s).is_some(), "{s} should be canonical");
        }
    }

    #[test]
    fn test_non_canonical_numbers() {
        for s in ["", "-", ".", "-0", "00", "01", "0.5", "1.", "1.50", "+1", "1e5", " 1", "1 ", "--1", "-.0"] {
            assert!(CanonicalNumber::parse(s).is_none(), "{s:?} should not be canonical");
        }
    }

    #[test]
    fn test_numbers_sort_numerically() {
        let mut subs: Vec<Subscript> = ["10", "9", "-3", ".5", "0", "-.25", "100", "1.5", "-20"]
            .iter()
            .map(|s| sub(s))
            .collect();
        subs.sort();
        let ordered: Vec<&str> = subs.iter().map(Subscript::as_str).collect();
        assert_eq!(ordered, ["-20", "-3", "-.25", "0", ".5", "1.5", "9", "10", "100"]);
    }

    #[test]
    fn test_numbers_before_strings() {
        assert!(sub("999999") < sub("A"));
        assert!(sub("-5") < sub(""));
        // Non-canonical numerics are strings
        assert!(sub("01").is_text());
        assert!(sub("99") < sub("01"));
    }

    #[test]
    fn test_strings_sort_by_bytes() {
        assert!(sub("ABC") < sub("ABCD"));
        assert!(sub("ABD") > sub("ABCD"));
        assert!(sub("Z") < sub("a"));
        assert!(sub("") < sub("A"));
    }

    #[test]
    fn test_collation_key_matches_ord() {
        let samples = [
            "-100", "-20", "-1.5", "-1", "-.001", "0", ".001", ".01", ".1", "1", "1.05", "1.5", "2", "10",
            "100", "", "\u{0}", "\u{0}a", "A", "AB", "ABC", "B", "a", "zz", "01", "1.50",
        ];
        for a in samples {
            for b in samples {
                let (sa, sb) = (sub(a), sub(b));
                assert_eq!(
                    sa.cmp(&sb),
                    sa.collation_key().cmp(&sb.collation_key()),
                    "{a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn test_collation_key_is_self_delimiting() {
        // A child key must sort after its parent and before the parent's next sibling.
        let parent = sub("AB").collation_key();
        let mut child = parent.clone();
        sub("1").encode_into(&mut child);
        let sibling = sub("ABC").collation_key();

        assert!(parent < child);
        assert!(child < sibling);

        let mut upper = parent.clone();
        upper.push(KEY_UPPER_SENTINEL);
        assert!(child < upper);
        assert!(upper < sibling);
    }

    #[test]
    fn test_text_prefix_key_bounds_matching_strings() {
        let lo = text_prefix_key("SMI");
        let mut hi = lo.clone();
        hi.push(KEY_UPPER_SENTINEL);

        for inside in ["SMI", "SMITH", "SMIZZZ"] {
            let key = sub(inside).collation_key();
            assert!(key >= lo && key < hi, "{inside} should be in range");
        }
        for outside in ["SMH", "SMJ", "SM", "1"] {
            let key = sub(outside).collation_key();
            assert!(key < lo || key >= hi, "{outside} should be out of range");
        }
    }

    #[test]
    fn test_display_quotes_strings() {
        assert_eq!(sub("12").to_string(), "12");
        assert_eq!(sub("SMITH,JOHN").to_string(), "\"SMITH,JOHN\"");
        assert_eq!(sub("say \"hi\"").to_string(), "\"say \"\"hi\"\"\"");
    }
}
