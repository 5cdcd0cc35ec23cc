// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global addresses and values.
//!
//! A [`GlobalAddress`] is a global name plus an ordered list of
//! [`Subscript`]s, for example `^DPT("B","SMITH,JOHN",42)`.
//!
//! # Example
//!
//! ```
//! use globals_engine::{GlobalAddress, Subscript};
//!
//! let addr = GlobalAddress::new("DPT", ["B", "SMITH,JOHN", "42"]).unwrap();
//! assert_eq!(addr.name(), "^DPT");
//! assert_eq!(addr.to_string(), "^DPT(\"B\",\"SMITH,JOHN\",42)");
//! assert!(addr.subscripts()[2].is_number());
//!
//! let parsed: GlobalAddress = "^DPT(\"B\",\"SMITH,JOHN\",42)".parse().unwrap();
//! assert_eq!(parsed, addr);
//! ```

mod collation;

pub use collation::{CanonicalNumber, Subscript, KEY_UPPER_SENTINEL};
pub(crate) use collation::text_prefix_key;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::adapter::traits::GlobalsError;

/// Address of a node in a global.
///
/// Equality is element-wise on the sigil-normalized name and subscripts.
/// Ordering is by name, then subscripts under MUMPS collation; a node sorts
/// before all of its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalAddress {
    name: String,
    subscripts: Vec<Subscript>,
}

impl GlobalAddress {
    /// Build an address. The `^` sigil is added if missing.
    pub fn new<I, S>(name: &str, subscripts: I) -> Result<Self, GlobalsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Subscript>,
    {
        Ok(Self {
            name: normalize_name(name)?,
            subscripts: subscripts.into_iter().map(Into::into).collect(),
        })
    }

    /// Address of the global root (no subscripts).
    pub fn root(name: &str) -> Result<Self, GlobalsError> {
        Self::new(name, std::iter::empty::<Subscript>())
    }

    /// Sigil-normalized global name, e.g. `^DPT`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn subscripts(&self) -> &[Subscript] {
        &self.subscripts
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.subscripts.len()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Subscript> {
        self.subscripts.last()
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.subscripts.is_empty() {
            return None;
        }
        Some(Self {
            name: self.name.clone(),
            subscripts: self.subscripts[..self.subscripts.len() - 1].to_vec(),
        })
    }

    /// New address one level deeper.
    #[must_use]
    pub fn child(&self, subscript: impl Into<Subscript>) -> Self {
        let mut subscripts = self.subscripts.clone();
        subscripts.push(subscript.into());
        Self {
            name: self.name.clone(),
            subscripts,
        }
    }

    /// Same parent, different last subscript. A root address gains one level.
    #[must_use]
    pub fn sibling(&self, subscript: impl Into<Subscript>) -> Self {
        let mut subscripts = self.subscripts.clone();
        subscripts.pop();
        subscripts.push(subscript.into());
        Self {
            name: self.name.clone(),
            subscripts,
        }
    }

    /// Same global, different subscripts.
    #[must_use]
    pub fn with_subscripts(&self, subscripts: Vec<Subscript>) -> Self {
        Self {
            name: self.name.clone(),
            subscripts,
        }
    }

    /// True when `other` lives strictly below `self` in the same global.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.name == other.name
            && other.subscripts.len() > self.subscripts.len()
            && other.subscripts[..self.subscripts.len()] == self.subscripts[..]
    }

    /// Concatenated subscript collation keys (the global name is not included).
    #[must_use]
    pub fn collation_key(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for subscript in &self.subscripts {
            subscript.encode_into(&mut out);
        }
        out
    }

    /// Exclusive upper bound of the keys of every descendant.
    #[must_use]
    pub fn descendant_upper_key(&self) -> Vec<u8> {
        let mut key = self.collation_key();
        key.push(KEY_UPPER_SENTINEL);
        key
    }

    /// Subscripts in text form, as persisted by relational adapters.
    #[must_use]
    pub fn subscript_strings(&self) -> Vec<String> {
        self.subscripts.iter().map(|s| s.as_str().to_string()).collect()
    }

    /// Validate the address names a concrete node (no empty subscripts).
    pub fn ensure_node(&self) -> Result<(), GlobalsError> {
        if self.subscripts.iter().any(Subscript::is_empty) {
            return Err(GlobalsError::Validation(format!(
                "{} contains an empty subscript",
                self
            )));
        }
        Ok(())
    }

    /// Validate the address is usable as an `order` cursor: at least one
    /// subscript, and only the last may be empty.
    pub fn ensure_order_cursor(&self) -> Result<(), GlobalsError> {
        let Some((_, parents)) = self.subscripts.split_last() else {
            return Err(GlobalsError::Validation(format!(
                "order requires at least one subscript: {}",
                self
            )));
        };
        if parents.iter().any(Subscript::is_empty) {
            return Err(GlobalsError::Validation(format!(
                "only the last subscript may be empty: {}",
                self
            )));
        }
        Ok(())
    }

    /// True when the name and every subscript are plain ASCII.
    #[must_use]
    pub fn is_ascii(&self) -> bool {
        self.name.is_ascii() && self.subscripts.iter().all(|s| s.as_str().is_ascii())
    }
}

fn normalize_name(name: &str) -> Result<String, GlobalsError> {
    let bare = name.strip_prefix('^').unwrap_or(name);
    let mut chars = bare.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first == '%' || first.is_ascii_alphabetic()) && chars.all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    };
    if !valid {
        return Err(GlobalsError::Validation(format!(
            "invalid global name: {:?}",
            name
        )));
    }
    Ok(format!("^{}", bare))
}

impl fmt::Display for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some((first, rest)) = self.subscripts.split_first() {
            write!(f, "({}", first)?;
            for subscript in rest {
                write!(f, ",{}", subscript)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Parses MUMPS reference syntax: `^NAME` or `^NAME(sub,...)` where each
/// subscript is a quoted string (`""` escapes a quote) or a canonical number.
impl FromStr for GlobalAddress {
    type Err = GlobalsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| GlobalsError::Validation(format!("{}: {:?}", why, s));

        let Some(open) = s.find('(') else {
            return Self::root(s);
        };
        let name = &s[..open];
        let body = s[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| invalid("missing closing parenthesis"))?;

        let mut subscripts = Vec::new();
        let mut chars = body.chars().peekable();
        loop {
            let mut token = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            token.push('"');
                        }
                        Some('"') => break,
                        Some(c) => token.push(c),
                        None => return Err(invalid("unterminated string subscript")),
                    }
                }
                subscripts.push(Subscript::parse(token));
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                match CanonicalNumber::parse(&token) {
                    Some(number) => subscripts.push(Subscript::Number(number)),
                    None => return Err(invalid("unquoted subscript is not a canonical number")),
                }
            }

            match chars.next() {
                Some(',') => continue,
                None => break,
                Some(_) => return Err(invalid("expected ',' between subscripts")),
            }
        }

        Self::new(name, subscripts)
    }
}

/// Value stored at a node. Absence means "undefined".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalValue(Option<String>);

impl GlobalValue {
    #[must_use]
    pub fn undefined() -> Self {
        Self(None)
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(Some(value.into()))
    }

    /// Value as written by `set`: the empty string deletes, so it reads back
    /// as undefined.
    #[must_use]
    pub fn from_written(value: &str) -> Self {
        if value.is_empty() {
            Self::undefined()
        } else {
            Self::new(value)
        }
    }

    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.0.is_some()
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    #[must_use]
    pub fn into_inner(self) -> Option<String> {
        self.0
    }
}

impl From<&str> for GlobalValue {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for GlobalValue {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<Option<String>> for GlobalValue {
    fn from(value: Option<String>) -> Self {
        Self(value)
    }
}

impl fmt::Display for GlobalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => write!(f, "{}", value),
            None => write!(f, "<undefined>"),
        }
    }
}

/// `$DATA` of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataStatus {
    /// No value, no descendants (0)
    Undefined,
    /// Value, no descendants (1)
    HasValue,
    /// Descendants only (10)
    HasDescendants,
    /// Value and descendants (11)
    HasBoth,
}

impl DataStatus {
    #[must_use]
    pub fn from_parts(has_value: bool, has_descendants: bool) -> Self {
        match (has_value, has_descendants) {
            (false, false) => Self::Undefined,
            (true, false) => Self::HasValue,
            (false, true) => Self::HasDescendants,
            (true, true) => Self::HasBoth,
        }
    }

    /// Numeric `$DATA` code: 0, 1, 10 or 11.
    #[must_use]
    pub fn as_code(&self) -> u8 {
        match self {
            Self::Undefined => 0,
            Self::HasValue => 1,
            Self::HasDescendants => 10,
            Self::HasBoth => 11,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Undefined),
            1 => Some(Self::HasValue),
            10 => Some(Self::HasDescendants),
            11 => Some(Self::HasBoth),
            _ => None,
        }
    }

    #[must_use]
    pub fn has_value(&self) -> bool {
        matches!(self, Self::HasValue | Self::HasBoth)
    }

    #[must_use]
    pub fn has_descendants(&self) -> bool {
        matches!(self, Self::HasDescendants | Self::HasBoth)
    }

    #[must_use]
    pub fn is_defined(&self) -> bool {
        !matches!(self, Self::Undefined)
    }
}

impl fmt::Display for DataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_normalization() {
        let a = GlobalAddress::root("DPT").unwrap();
        let b = GlobalAddress::root("^DPT").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name(), "^DPT");
        assert!(GlobalAddress::root("%ZOSF").is_ok());
    }

    #[test]
    fn test_invalid_names_rejected() {
        for name in ["", "^", "1ABC", "^A-B", "A B", "^^X"] {
            assert!(
                matches!(GlobalAddress::root(name), Err(GlobalsError::Validation(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_equality_is_elementwise() {
        let a = GlobalAddress::new("X", ["1", "A"]).unwrap();
        let b = GlobalAddress::new("^X", vec![Subscript::from(1i64), Subscript::from("A")]).unwrap();
        let c = GlobalAddress::new("X", ["01", "A"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parent_sorts_before_descendants() {
        let parent = GlobalAddress::new("X", ["A"]).unwrap();
        let child = parent.child(1i64);
        let sibling = parent.sibling("B");
        assert!(parent < child);
        assert!(child < sibling);
        assert!(parent.is_ancestor_of(&child));
        assert!(!parent.is_ancestor_of(&sibling));
        assert!(!parent.is_ancestor_of(&parent));
        assert_eq!(child.parent(), Some(parent));
    }

    #[test]
    fn test_descendant_key_range() {
        let parent = GlobalAddress::new("X", ["A"]).unwrap();
        let lo = parent.collation_key();
        let hi = parent.descendant_upper_key();
        let child = parent.child("ZZZ").child(5i64).collation_key();
        let next = parent.sibling("AA").collation_key();
        assert!(child > lo && child < hi);
        assert!(next >= hi);
    }

    #[test]
    fn test_parse_reference_syntax() {
        let addr: GlobalAddress = "^DPT(\"B\",\"O'BRIEN \"\"JR\"\"\",-1.5)".parse().unwrap();
        assert_eq!(addr.depth(), 3);
        assert_eq!(addr.subscripts()[1].as_str(), "O'BRIEN \"JR\"");
        assert!(addr.subscripts()[2].is_number());

        let root: GlobalAddress = "^DPT".parse().unwrap();
        assert_eq!(root.depth(), 0);

        // Round trip through Display
        assert_eq!(addr.to_string().parse::<GlobalAddress>().unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["^DPT(", "^DPT(\"B\"", "^DPT(B)", "^DPT(01)", "^DPT(\"A\"x)"] {
            assert!(bad.parse::<GlobalAddress>().is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn test_quoted_canonical_number_is_numeric() {
        // ^X("12") and ^X(12) name the same node; ^X("012") does not.
        let quoted: GlobalAddress = "^X(\"12\")".parse().unwrap();
        let bare: GlobalAddress = "^X(12)".parse().unwrap();
        assert_eq!(quoted, bare);
        let padded: GlobalAddress = "^X(\"012\")".parse().unwrap();
        assert!(padded.subscripts()[0].is_text());
    }

    #[test]
    fn test_ensure_node_and_cursor() {
        let node = GlobalAddress::new("X", ["A", ""]).unwrap();
        assert!(node.ensure_node().is_err());
        assert!(node.ensure_order_cursor().is_ok());

        let bad_cursor = GlobalAddress::new("X", ["", "A"]).unwrap();
        assert!(bad_cursor.ensure_order_cursor().is_err());
        assert!(GlobalAddress::root("X").unwrap().ensure_order_cursor().is_err());
    }

    #[test]
    fn test_global_value() {
        assert!(!GlobalValue::undefined().is_defined());
        assert_eq!(GlobalValue::from_written(""), GlobalValue::undefined());
        assert_eq!(GlobalValue::from_written("x").as_str(), Some("x"));
        assert_eq!(GlobalValue::undefined().to_string(), "<undefined>");
    }

    #[test]
    fn test_data_status_codes() {
        for status in [
            DataStatus::Undefined,
            DataStatus::HasValue,
            DataStatus::HasDescendants,
            DataStatus::HasBoth,
        ] {
            assert_eq!(DataStatus::from_code(status.as_code()), Some(status));
        }
        assert_eq!(DataStatus::from_code(2), None);
        assert_eq!(DataStatus::from_parts(true, true), DataStatus::HasBoth);
        assert!(DataStatus::HasDescendants.has_descendants());
        assert!(!DataStatus::HasDescendants.has_value());
    }
}
