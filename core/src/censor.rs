//! Transcript Redaction
//!
//! Rule-based redaction of sensitive content (phone numbers, emails,
//! passwords) in chat text before it is sent.
//!
//! # Model
//!
//! A [`Censor`] holds an ordered list of [`Rule`]s loaded once from a
//! server settings payload. Each rule has a chained search (one or more
//! patterns where each pattern narrows the matches of the previous one)
//! and an ordered list of replacements applied to every matched span.
//! A span whose content changes is wrapped as `{category:content}`;
//! tagged spans are excluded from later searches, which makes
//! processing idempotent.

use std::ops::Range;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

/// Errors producing a redaction engine from rule definitions.
#[derive(Debug, Error)]
pub enum CensorLoadError {
    /// The settings payload was not valid rules JSON.
    #[error("invalid rules payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    /// A pattern failed to compile.
    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern {
        /// The offending pattern string.
        pattern: String,
        /// The compile error.
        message: String,
    },
}

/// Where a rule applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleType {
    /// Applies when processing whole messages (and also to fragments).
    Message,
    /// Applies only when processing fragments of a message.
    Fragment,
}

/// A chained search: each pattern searches only within the spans the
/// previous pattern matched.
#[derive(Clone, Debug)]
pub struct Search {
    patterns: Vec<Regex>,
}

impl Search {
    /// Compile a chained search from pattern strings, in declared order.
    ///
    /// Patterns may be wrapped in `/.../`; all compile case-insensitive.
    pub fn from_patterns(patterns: &[&str]) -> Result<Self, CensorLoadError> {
        let patterns = patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }
}

/// A single replacement applied within a matched span.
#[derive(Clone, Debug)]
pub struct Replacement {
    search: Regex,
    replace: String,
}

impl Replacement {
    /// Compile a replacement.
    pub fn new(search: &str, replace: &str) -> Result<Self, CensorLoadError> {
        Ok(Self {
            search: compile_pattern(search)?,
            replace: replace.to_string(),
        })
    }
}

/// One redaction rule.
#[derive(Clone, Debug)]
pub struct Rule {
    rule_type: Option<RuleType>,
    category: String,
    search: Search,
    replacements: Vec<Replacement>,
}

impl Rule {
    /// Create a rule. A `None` rule type means [`RuleType::Message`].
    #[must_use]
    pub fn new(
        rule_type: Option<RuleType>,
        category: &str,
        search: Search,
        replacements: Vec<Replacement>,
    ) -> Self {
        Self {
            rule_type,
            category: category.to_string(),
            search,
            replacements,
        }
    }
}

/// The redaction engine.
#[derive(Clone, Debug, Default)]
pub struct Censor {
    rules: Vec<Rule>,
}

#[derive(Deserialize)]
struct RawRule {
    #[serde(rename = "Type")]
    rule_type: Option<u8>,
    #[serde(rename = "Category")]
    category: String,
    #[serde(rename = "Search")]
    search: RawSearch,
    #[serde(rename = "Replacements", default)]
    replacements: Vec<RawReplacement>,
}

#[derive(Deserialize)]
struct RawSearch {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Value")]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct RawReplacement {
    #[serde(rename = "Search")]
    search: String,
    #[serde(rename = "Replace")]
    replace: String,
}

impl Censor {
    /// Create an engine from already-built rules.
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Load rules from a settings payload: a JSON array of rule objects
    /// with PascalCase keys (`Type`, `Category`, `Search`,
    /// `Replacements`). Rule `Type` is numeric: 2 = message,
    /// 3 = fragment; missing means message. `Search.Type` is `regex`
    /// (string value) or `recursive` (nested searches, flattened in
    /// declared order).
    ///
    /// Rules that cannot be compiled are dropped with a warning; only a
    /// malformed payload is an error.
    pub fn from_settings(json: &str) -> Result<Self, CensorLoadError> {
        let raw: Vec<RawRule> = serde_json::from_str(json)?;
        let mut rules = Vec::with_capacity(raw.len());
        for raw_rule in raw {
            match build_rule(raw_rule) {
                Some(rule) => rules.push(rule),
                None => tracing::warn!("dropped unusable redaction rule"),
            }
        }
        Ok(Self { rules })
    }

    /// Redact a whole message. Applies message-typed rules only.
    #[must_use]
    pub fn process_message(&self, text: &str) -> String {
        self.process(text, RuleType::Message)
    }

    /// Redact a fragment of a message. Applies all rules.
    #[must_use]
    pub fn process_fragment(&self, text: &str) -> String {
        self.process(text, RuleType::Fragment)
    }

    fn process(&self, text: &str, context: RuleType) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut text = text.to_string();
        for rule in &self.rules {
            let applies = context == RuleType::Fragment
                || rule.rule_type.unwrap_or(RuleType::Message) == RuleType::Message;
            if !applies {
                continue;
            }
            let untagged = untagged_ranges(&text);
            let matched = chained_search(&text, untagged, &rule.search.patterns);
            text = replace_ranges(&text, &matched, rule);
        }
        text
    }
}

fn build_rule(raw: RawRule) -> Option<Rule> {
    let rule_type = match raw.rule_type {
        None => None,
        Some(2) => Some(RuleType::Message),
        Some(3) => Some(RuleType::Fragment),
        Some(other) => {
            tracing::warn!(rule_type = other, category = %raw.category, "unknown rule type");
            return None;
        }
    };

    let mut patterns = Vec::new();
    collect_patterns(&raw.search, &mut patterns);
    if patterns.is_empty() {
        tracing::warn!(category = %raw.category, "rule has no usable search patterns");
        return None;
    }

    let mut replacements = Vec::with_capacity(raw.replacements.len());
    for raw_replacement in raw.replacements {
        match Replacement::new(&raw_replacement.search, &raw_replacement.replace) {
            Ok(replacement) => replacements.push(replacement),
            Err(e) => {
                tracing::warn!(error = %e, category = %raw.category, "invalid replacement");
                return None;
            }
        }
    }

    Some(Rule {
        rule_type,
        category: raw.category,
        search: Search { patterns },
        replacements,
    })
}

fn collect_patterns(search: &RawSearch, out: &mut Vec<Regex>) {
    match search.kind.as_str() {
        "regex" => {
            if let Some(pattern) = search.value.as_str() {
                match compile_pattern(pattern) {
                    Ok(regex) => out.push(regex),
                    Err(e) => tracing::warn!(error = %e, "dropped search pattern"),
                }
            }
        }
        "recursive" => {
            let nested: Vec<RawSearch> = match serde_json::from_value(search.value.clone()) {
                Ok(nested) => nested,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed recursive search");
                    return;
                }
            };
            for inner in &nested {
                collect_patterns(inner, out);
            }
        }
        other => tracing::warn!(kind = other, "unknown search type"),
    }
}

/// Strip `/.../` wrapping and compile case-insensitive.
fn compile_pattern(pattern: &str) -> Result<Regex, CensorLoadError> {
    let body = pattern
        .strip_prefix('/')
        .and_then(|p| p.strip_suffix('/'))
        .unwrap_or(pattern);
    RegexBuilder::new(body)
        .case_insensitive(true)
        .build()
        .map_err(|e| CensorLoadError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| {
        RegexBuilder::new(r"\{[0-9a-z]+:[^}]+\}")
            .case_insensitive(true)
            .build()
            .unwrap_or_else(|_| unreachable!("tag pattern is valid"))
    })
}

/// Byte ranges of `text` not covered by a `{category:content}` tag.
fn untagged_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut cursor = 0;
    for tag in tag_regex().find_iter(text) {
        ranges.push(cursor..tag.start());
        cursor = tag.end();
    }
    ranges.push(cursor..text.len());
    ranges
}

/// Narrow `ranges` through the chain of `patterns`, in declared order.
fn chained_search(
    text: &str,
    mut ranges: Vec<Range<usize>>,
    patterns: &[Regex],
) -> Vec<Range<usize>> {
    for pattern in patterns {
        if ranges.is_empty() {
            return ranges;
        }
        let mut narrowed = Vec::new();
        for range in &ranges {
            for found in pattern.find_iter(&text[range.clone()]) {
                narrowed.push(range.start + found.start()..range.start + found.end());
            }
        }
        ranges = narrowed;
    }
    ranges
}

/// Apply a rule's replacements to each matched range and splice the
/// results back, last range first so earlier offsets stay valid.
fn replace_ranges(text: &str, ranges: &[Range<usize>], rule: &Rule) -> String {
    let mut output = text.to_string();
    for range in ranges.iter().rev() {
        let original = &text[range.clone()];
        let mut current = original.to_string();
        for replacement in &rule.replacements {
            current = replace_all_nonempty(&replacement.search, &current, &replacement.replace);
        }
        if current != original {
            output.replace_range(
                range.clone(),
                &format!("{{{}:{}}}", rule.category, current),
            );
        }
    }
    output
}

/// `Regex::replace_all` that skips zero-length matches, so a pattern
/// like `.*` replaces a span exactly once.
fn replace_all_nonempty(pattern: &Regex, haystack: &str, template: &str) -> String {
    let mut result = String::with_capacity(haystack.len());
    let mut last = 0;
    for captures in pattern.captures_iter(haystack) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if whole.start() == whole.end() {
            continue;
        }
        result.push_str(&haystack[last..whole.start()]);
        captures.expand(template, &mut result);
        last = whole.end();
    }
    result.push_str(&haystack[last..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn phone_rule() -> Rule {
        Rule::new(
            Some(RuleType::Message),
            "phone",
            Search::from_patterns(&[r"\d{3}-\d{3}-\d{4}"]).unwrap(),
            vec![Replacement::new("[0-9]", "#").unwrap()],
        )
    }

    fn password_rule() -> Rule {
        Rule::new(
            Some(RuleType::Fragment),
            "password",
            Search::from_patterns(&[r"^[\s\S]*\b(password|passcode)\b[\s\S]*$", r"[^a-z\s]+"])
                .unwrap(),
            vec![
                Replacement::new(r"[^a-z0-9\s#]", "*").unwrap(),
                Replacement::new("[0-9]", "#").unwrap(),
            ],
        )
    }

    #[test]
    fn test_message_rule_tags_match() {
        let censor = Censor::new(vec![phone_rule()]);
        assert_eq!(
            censor.process_message("call 555-123-4567 now"),
            "call {phone:###-###-####} now"
        );
    }

    #[test]
    fn test_processing_is_idempotent() {
        let censor = Censor::new(vec![phone_rule()]);
        let once = censor.process_message("call 555-123-4567 now");
        let twice = censor.process_message(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_tagged_spans_are_excluded_from_search() {
        let censor = Censor::new(vec![phone_rule()]);
        let output = censor.process_message("{email:XXX} 555-123-4567");
        assert_eq!(output, "{email:XXX} {phone:###-###-####}");
    }

    #[test]
    fn test_full_span_replacement_applies_once() {
        let rule = Rule::new(
            Some(RuleType::Message),
            "phone",
            Search::from_patterns(&[r"\d{3}-\d{3}-\d{4}"]).unwrap(),
            vec![Replacement::new(".*", "REDACTED").unwrap()],
        );
        let censor = Censor::new(vec![rule]);
        assert_eq!(
            censor.process_message("call 555-123-4567 now"),
            "call {phone:REDACTED} now"
        );
    }

    #[test]
    fn test_chained_search_requires_gate_pattern() {
        let censor = Censor::new(vec![password_rule()]);
        assert_eq!(
            censor.process_fragment("My password is hunter2"),
            "My password is hunter{password:#}"
        );
        // No keyword: the gate pattern matches nothing, nothing is tagged.
        assert_eq!(
            censor.process_fragment("My dog is hunter2"),
            "My dog is hunter2"
        );
    }

    #[test]
    fn test_fragment_typed_rule_skipped_for_messages() {
        let censor = Censor::new(vec![password_rule()]);
        assert_eq!(
            censor.process_message("My password is hunter2"),
            "My password is hunter2"
        );
    }

    #[test]
    fn test_fragment_processing_applies_message_rules_too() {
        let censor = Censor::new(vec![phone_rule()]);
        assert_eq!(
            censor.process_fragment("555-123-4567"),
            "{phone:###-###-####}"
        );
    }

    #[test]
    fn test_unchanged_replacement_leaves_span_untagged() {
        let rule = Rule::new(
            Some(RuleType::Message),
            "digits",
            Search::from_patterns(&["[0-9]+"]).unwrap(),
            vec![Replacement::new("[a-f]", "#").unwrap()],
        );
        let censor = Censor::new(vec![rule]);
        assert_eq!(censor.process_message("room 1234"), "room 1234");
    }

    #[test]
    fn test_patterns_compile_case_insensitive() {
        let rule = Rule::new(
            None,
            "greeting",
            Search::from_patterns(&["hello"]).unwrap(),
            vec![Replacement::new("[a-z]", "*").unwrap()],
        );
        let censor = Censor::new(vec![rule]);
        assert_eq!(censor.process_message("HELLO there"), "{greeting:*****} there");
    }

    #[test]
    fn test_empty_input_stays_empty() {
        let censor = Censor::new(vec![phone_rule()]);
        assert_eq!(censor.process_message(""), "");
    }

    #[test]
    fn test_load_rules_from_settings_payload() {
        let json = r##"[
            {
                "Type": 2,
                "Category": "digits",
                "Search": {"Type": "regex", "Value": "/[0-9]{4,}/"},
                "Replacements": [{"Search": "[0-9]", "Replace": "#"}]
            },
            {
                "Type": 3,
                "Category": "password",
                "Search": {
                    "Type": "recursive",
                    "Value": [
                        {"Type": "regex", "Value": "^[\\s\\S]*\\b(password)\\b[\\s\\S]*$"},
                        {"Type": "regex", "Value": "[^a-z\\s]+"}
                    ]
                },
                "Replacements": [{"Search": "[0-9]", "Replace": "#"}]
            }
        ]"##;
        let censor = Censor::from_settings(json).unwrap();
        assert_eq!(censor.rules.len(), 2);
        assert_eq!(censor.process_message("code 123456"), "code {digits:######}");
        assert_eq!(
            censor.process_fragment("password 42"),
            "password {password:##}"
        );
    }

    #[test]
    fn test_uncompilable_rule_is_dropped_not_fatal() {
        let json = r##"[
            {
                "Category": "broken",
                "Search": {"Type": "regex", "Value": "("},
                "Replacements": []
            },
            {
                "Category": "digits",
                "Search": {"Type": "regex", "Value": "[0-9]+"},
                "Replacements": [{"Search": "[0-9]", "Replace": "#"}]
            }
        ]"##;
        let censor = Censor::from_settings(json).unwrap();
        assert_eq!(censor.rules.len(), 1);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(Censor::from_settings("not json").is_err());
    }
}
