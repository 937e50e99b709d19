//! Error message canonicalisation and fingerprinting.
//!
//! Volatile substrings are replaced with tokens in a fixed order. Several
//! patterns overlap (a timestamp contains things that look like line numbers,
//! a path can end in `:42`), so the order below is part of the contract and
//! must not change without invalidating stored fingerprints:
//!
//! 1. timestamps            -> `<TS>`
//! 2. UUIDs                 -> `<UUID>`
//! 3. IPv4 addresses, hosts -> `<IP>`, `<HOST>`
//! 4. ports after a host    -> `<PORT>`
//! 5. durations             -> `<DURATION>`
//! 6. line numbers          -> `<LINE>`
//! 7. hex addresses         -> `<ADDR>`
//! 8. filesystem paths      -> `<PATH>`
//! 9. remaining numbers     -> `<NUM>`

use regex::Regex;
use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest.
pub const PATTERN_HASH_LEN: usize = 16;

/// Maximum length of a pattern summary.
pub const SUMMARY_MAX_CHARS: usize = 120;

struct Substitution {
    name: &'static str,
    pattern: Regex,
    replacement: &'static str,
}

pub struct PatternNormalizer {
    substitutions: Vec<Substitution>,
    whitespace: Regex,
}

impl PatternNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        let table: [(&'static str, &str, &'static str); 11] = [
            (
                "iso_timestamp",
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
                "<TS>",
            ),
            ("clock_time", r"\b\d{2}:\d{2}:\d{2}(?:\.\d+)?\b", "<TS>"),
            (
                "uuid",
                r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
                "<UUID>",
            ),
            ("ipv4", r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "<IP>"),
            (
                "host",
                r"(?i)\b(?:localhost|(?:[a-z0-9-]+\.)+(?:com|net|org|io|dev|local|internal|svc|cluster))\b",
                "<HOST>",
            ),
            ("port", r"(<IP>|<HOST>):\d{1,5}\b", "$1:<PORT>"),
            (
                "duration",
                r"(?i)\b\d+(?:\.\d+)?\s*(?:ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)\b",
                "<DURATION>",
            ),
            ("line_word", r"(?i)\bline\s+\d+", "line <LINE>"),
            ("line_suffix", r":\d+(?::\d+)?\b", ":<LINE>"),
            ("hex_address", r"(?i)\b0x[0-9a-f]+\b", "<ADDR>"),
            (
                "path",
                r"(?:[A-Za-z]:)?(?:[\\/][\w.@-]+){2,}[\\/]?|(?:[\w.@-]+[\\/]){1,}[\w@-]+\.\w+",
                "<PATH>",
            ),
        ];

        let mut substitutions = Vec::with_capacity(table.len() + 1);
        for (name, pattern, replacement) in table {
            substitutions.push(Substitution {
                name,
                pattern: Regex::new(pattern)?,
                replacement,
            });
        }
        substitutions.push(Substitution {
            name: "number",
            pattern: Regex::new(r"\b\d+(?:\.\d+)?\b")?,
            replacement: "<NUM>",
        });

        Ok(Self {
            substitutions,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn substitution_order(&self) -> Vec<&'static str> {
        self.substitutions.iter().map(|s| s.name).collect()
    }

    /// Canonical form of an error message.
    pub fn normalize(&self, message: &str) -> String {
        let mut current = message.to_string();
        for substitution in &self.substitutions {
            current = substitution
                .pattern
                .replace_all(&current, substitution.replacement)
                .into_owned();
        }
        self.whitespace
            .replace_all(current.trim(), " ")
            .to_lowercase()
    }

    /// `(pattern_hash, summary)` for a raw message.
    pub fn fingerprint(&self, message: &str) -> (String, String) {
        let canonical = self.normalize(message);
        let hash = pattern_hash(&canonical);
        (hash, summarize(&canonical))
    }
}

/// First 16 hex characters of the SHA-256 digest of a canonical string.
pub fn pattern_hash(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(PATTERN_HASH_LEN);
    for byte in digest.iter().take(PATTERN_HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn summarize(canonical: &str) -> String {
    if canonical.chars().count() <= SUMMARY_MAX_CHARS {
        return canonical.to_string();
    }
    let mut summary: String = canonical.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    summary.push_str("...");
    summary
}
