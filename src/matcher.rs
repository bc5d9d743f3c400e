use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Shared cache of compiled regexes, keyed by pattern. Rulesets are built
/// rarely and reuse patterns often; the cache is read-mostly and bounded.
static REGEX_CACHE: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::new);

const REGEX_CACHE_LIMIT: usize = 4096;

/// Compile `pattern`, reusing a previously compiled program when the same
/// pattern was seen before.
pub fn compile_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    if let Some(hit) = REGEX_CACHE.get(pattern) {
        return Ok(hit.clone());
    }
    let compiled = Regex::new(pattern)?;
    if REGEX_CACHE.len() < REGEX_CACHE_LIMIT {
        REGEX_CACHE.insert(pattern.to_string(), compiled.clone());
    }
    Ok(compiled)
}

/// Check primitive types accepted by the ruleset source language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Start,
    End,
    NStart,
    NEnd,
    Incl,
    Ni,
    NcsStart,
    NcsEnd,
    NcsNstart,
    NcsNend,
    NcsIncl,
    NcsNi,
    Equ,
    Neq,
    NcsEqu,
    NcsNeq,
    Mt,
    Lt,
    Regex,
    IsNull,
    NotNull,
    Plugin,
}

impl MatchType {
    pub fn parse(token: &str) -> Option<Self> {
        let mt = match token {
            "START" => MatchType::Start,
            "END" => MatchType::End,
            "NSTART" => MatchType::NStart,
            "NEND" => MatchType::NEnd,
            "INCL" => MatchType::Incl,
            "NI" => MatchType::Ni,
            "NCS_START" => MatchType::NcsStart,
            "NCS_END" => MatchType::NcsEnd,
            "NCS_NSTART" => MatchType::NcsNstart,
            "NCS_NEND" => MatchType::NcsNend,
            "NCS_INCL" => MatchType::NcsIncl,
            "NCS_NI" => MatchType::NcsNi,
            "EQU" => MatchType::Equ,
            "NEQ" => MatchType::Neq,
            "NCS_EQU" => MatchType::NcsEqu,
            "NCS_NEQ" => MatchType::NcsNeq,
            "MT" => MatchType::Mt,
            "LT" => MatchType::Lt,
            "REGEX" => MatchType::Regex,
            "ISNULL" => MatchType::IsNull,
            "NOTNULL" => MatchType::NotNull,
            "PLUGIN" => MatchType::Plugin,
            _ => return None,
        };
        Some(mt)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Start => "START",
            MatchType::End => "END",
            MatchType::NStart => "NSTART",
            MatchType::NEnd => "NEND",
            MatchType::Incl => "INCL",
            MatchType::Ni => "NI",
            MatchType::NcsStart => "NCS_START",
            MatchType::NcsEnd => "NCS_END",
            MatchType::NcsNstart => "NCS_NSTART",
            MatchType::NcsNend => "NCS_NEND",
            MatchType::NcsIncl => "NCS_INCL",
            MatchType::NcsNi => "NCS_NI",
            MatchType::Equ => "EQU",
            MatchType::Neq => "NEQ",
            MatchType::NcsEqu => "NCS_EQU",
            MatchType::NcsNeq => "NCS_NEQ",
            MatchType::Mt => "MT",
            MatchType::Lt => "LT",
            MatchType::Regex => "REGEX",
            MatchType::IsNull => "ISNULL",
            MatchType::NotNull => "NOTNULL",
            MatchType::Plugin => "PLUGIN",
        }
    }

    /// Evaluation cost tier used to reorder nodes inside one checklist:
    /// null probes first, plain string/numeric ops next, regexes, then
    /// plugin calls.
    pub fn cost_tier(&self) -> u8 {
        match self {
            MatchType::IsNull | MatchType::NotNull => 0,
            MatchType::Regex => 2,
            MatchType::Plugin => 3,
            _ => 1,
        }
    }

    /// True when the primitive needs a comparison value in the source.
    pub fn requires_value(&self) -> bool {
        !matches!(self, MatchType::IsNull | MatchType::NotNull)
    }
}

/// Apply a string primitive. `REGEX` and `PLUGIN` are dispatched by the
/// executor against their compiled/bound forms and must not reach here.
///
/// Empty-needle rules follow the source language contract: prefix/suffix
/// primitives and their negations are all true on an empty needle; `INCL`
/// is true on an empty needle while `NI` is then true only for an empty
/// haystack.
pub fn string_match(match_type: MatchType, haystack: &str, needle: &str) -> bool {
    match match_type {
        MatchType::Start => haystack.starts_with(needle),
        MatchType::End => haystack.ends_with(needle),
        MatchType::NStart => {
            if needle.is_empty() {
                true
            } else {
                !haystack.starts_with(needle)
            }
        }
        MatchType::NEnd => {
            if needle.is_empty() {
                true
            } else {
                !haystack.ends_with(needle)
            }
        }
        MatchType::Incl => haystack.contains(needle),
        MatchType::Ni => {
            if needle.is_empty() {
                haystack.is_empty()
            } else {
                !haystack.contains(needle)
            }
        }
        MatchType::NcsStart => fold(haystack).starts_with(&fold(needle)),
        MatchType::NcsEnd => fold(haystack).ends_with(&fold(needle)),
        MatchType::NcsNstart => {
            if needle.is_empty() {
                true
            } else {
                !fold(haystack).starts_with(&fold(needle))
            }
        }
        MatchType::NcsNend => {
            if needle.is_empty() {
                true
            } else {
                !fold(haystack).ends_with(&fold(needle))
            }
        }
        MatchType::NcsIncl => fold(haystack).contains(&fold(needle)),
        MatchType::NcsNi => {
            if needle.is_empty() {
                haystack.is_empty()
            } else {
                !fold(haystack).contains(&fold(needle))
            }
        }
        // EQU/NEQ intentionally compare ASCII-case-insensitively; the
        // lowercased variants use a full Unicode fold.
        MatchType::Equ => haystack.eq_ignore_ascii_case(needle),
        MatchType::Neq => !haystack.eq_ignore_ascii_case(needle),
        MatchType::NcsEqu => haystack.to_lowercase() == needle.to_lowercase(),
        MatchType::NcsNeq => haystack.to_lowercase() != needle.to_lowercase(),
        MatchType::Mt => numeric_compare(haystack, needle, |a, b| a > b),
        MatchType::Lt => numeric_compare(haystack, needle, |a, b| a < b),
        MatchType::IsNull => haystack.trim().is_empty(),
        MatchType::NotNull => !haystack.trim().is_empty(),
        MatchType::Regex | MatchType::Plugin => false,
    }
}

fn fold(s: &str) -> String {
    s.to_ascii_lowercase()
}

fn numeric_compare(haystack: &str, needle: &str, cmp: fn(f64, f64) -> bool) -> bool {
    let Ok(lhs) = haystack.trim().parse::<f64>() else {
        return false;
    };
    let Ok(rhs) = needle.trim().parse::<f64>() else {
        return false;
    };
    cmp(lhs, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn prefix_suffix_and_contains() {
        assert!(string_match(MatchType::Start, "curl http://x", "curl"));
        assert!(!string_match(MatchType::Start, "wget http://x", "curl"));
        assert!(string_match(MatchType::End, "evil.tld", ".tld"));
        assert!(string_match(MatchType::Incl, "curl http://evil.tld", "evil.tld"));
        assert!(string_match(MatchType::Ni, "benign", "evil"));
    }

    #[test]
    fn empty_needle_rules() {
        assert!(string_match(MatchType::Start, "abc", ""));
        assert!(string_match(MatchType::NStart, "abc", ""));
        assert!(string_match(MatchType::End, "abc", ""));
        assert!(string_match(MatchType::NEnd, "abc", ""));
        assert!(string_match(MatchType::Incl, "abc", ""));
        assert!(!string_match(MatchType::Ni, "abc", ""));
        assert!(string_match(MatchType::Ni, "", ""));
        assert!(string_match(MatchType::NcsNstart, "abc", ""));
        assert!(!string_match(MatchType::NcsNi, "abc", ""));
    }

    #[test]
    fn case_insensitive_variants() {
        assert!(string_match(MatchType::NcsIncl, "Curl HTTP://EVIL.TLD", "evil.tld"));
        assert!(string_match(MatchType::NcsStart, "POWERSHELL -enc", "powershell"));
        assert!(string_match(MatchType::NcsEqu, "Admin", "admin"));
        assert!(string_match(MatchType::NcsNeq, "Admin", "root"));
    }

    #[test]
    fn equality_is_ascii_case_insensitive() {
        // The case-sensitive variant still folds ASCII case.
        assert!(string_match(MatchType::Equ, "Trusted", "trusted"));
        assert!(!string_match(MatchType::Equ, "trusted", "other"));
        assert!(string_match(MatchType::Neq, "a", "b"));
    }

    #[test]
    fn numeric_comparison() {
        assert!(string_match(MatchType::Mt, "10", "9.5"));
        assert!(!string_match(MatchType::Mt, "9", "10"));
        assert!(string_match(MatchType::Lt, "-1", "0"));
        // Parse failures are false, not errors.
        assert!(!string_match(MatchType::Mt, "ten", "9"));
        assert!(!string_match(MatchType::Lt, "1", "many"));
    }

    #[test]
    fn null_probes_trim() {
        assert!(string_match(MatchType::IsNull, "   ", "ignored"));
        assert!(string_match(MatchType::IsNull, "", ""));
        assert!(string_match(MatchType::NotNull, " x ", ""));
        assert!(!string_match(MatchType::NotNull, "\t\n", ""));
    }

    #[test]
    fn regex_cache_reuses_compiled_patterns() {
        let a = compile_regex(r"ev[i1]l\.tld").unwrap();
        let b = compile_regex(r"ev[i1]l\.tld").unwrap();
        assert_eq!(a.as_str(), b.as_str());
        assert!(a.is_match("ev1l.tld"));
        assert!(compile_regex("[unclosed").is_err());
    }

    #[test]
    fn parse_round_trips_every_token() {
        for token in [
            "START", "END", "NSTART", "NEND", "INCL", "NI", "NCS_START", "NCS_END", "NCS_NSTART",
            "NCS_NEND", "NCS_INCL", "NCS_NI", "EQU", "NEQ", "NCS_EQU", "NCS_NEQ", "MT", "LT",
            "REGEX", "ISNULL", "NOTNULL", "PLUGIN",
        ] {
            let mt = MatchType::parse(token).expect(token);
            assert_eq!(mt.as_str(), token);
        }
        assert!(MatchType::parse("GLOB").is_none());
    }

    proptest! {
        #[test]
        fn negations_invert_on_nonempty_needles(h in ".{0,24}", n in ".{1,8}") {
            prop_assert_eq!(
                string_match(MatchType::NStart, &h, &n),
                !string_match(MatchType::Start, &h, &n)
            );
            prop_assert_eq!(
                string_match(MatchType::NEnd, &h, &n),
                !string_match(MatchType::End, &h, &n)
            );
            prop_assert_eq!(
                string_match(MatchType::Ni, &h, &n),
                !string_match(MatchType::Incl, &h, &n)
            );
        }

        #[test]
        fn equality_agrees_with_ascii_fold(a in "[a-zA-Z0-9]{0,12}", b in "[a-zA-Z0-9]{0,12}") {
            prop_assert_eq!(
                string_match(MatchType::Equ, &a, &b),
                a.to_ascii_lowercase() == b.to_ascii_lowercase()
            );
            prop_assert_eq!(
                string_match(MatchType::Neq, &a, &b),
                a.to_ascii_lowercase() != b.to_ascii_lowercase()
            );
        }
    }
}
