#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_casefold::UnicodeCaseFold;
use unicode_normalization::UnicodeNormalization;

/// Stable identifier derived from normalized statement text.
///
/// Every ordering and tie-breaking decision in the engine runs over these
/// ids; display identifiers are never ordering-significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    #[must_use]
    pub fn of(statement: &str) -> Self {
        Self::of_bytes(canonicalize(statement).as_bytes())
    }

    /// Hash raw bytes without text normalization, for fingerprinting
    /// serialized structures.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push(HEX[(byte >> 4) as usize]);
            hex.push(HEX[(byte & 0x0f) as usize]);
        }
        Self(hex)
    }

    pub fn from_hex(hex: impl Into<String>) -> Result<Self, CanonError> {
        let hex = hex.into();
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(CanonError::MalformedId { id: hex });
        }
        Ok(Self(hex))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex characters, for log lines and display surfaces.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const HEX: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonError {
    #[error("canonical id must be 64 lowercase hex characters, got {id:?}")]
    MalformedId { id: String },
}

/// Normalize statement text: NFC, case fold, strip punctuation, collapse
/// whitespace, trim. Referentially transparent.
#[must_use]
pub fn canonicalize(text: &str) -> String {
    let recomposed: String = text.nfc().collect();
    let folded: String = recomposed.as_str().case_fold().collect();
    let stripped: String = folded
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    collapse_whitespace(&stripped)
}

/// Normalize quoted evidence text for fidelity comparison: NFC, strip
/// zero-width and control characters, map typographic punctuation to its
/// ASCII counterpart, collapse whitespace. Case is preserved.
#[must_use]
pub fn normalize_quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.nfc() {
        if is_zero_width(c) || (c.is_control() && !c.is_whitespace()) {
            continue;
        }
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{2032}' => out.push('\''),
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{2033}' => out.push('"'),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' => {
                out.push('-');
            }
            '\u{2026}' => out.push_str("..."),
            '\u{00a0}' => out.push(' '),
            _ => out.push(c),
        }
    }
    collapse_whitespace(&out)
}

fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}' | '\u{feff}'
    )
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}
