//! SMART extraction
//!
//! Turns a free-text ambition into a best-guess [`SmartCriteria`] draft.
//! Extractors may leave any field empty; GoalManager asks the user for the
//! rest. Every extracted value passes through [`sanitize`] before it is
//! trusted.

use super::recall::MemoryContext;
use super::types::{SmartCriteria, SmartField};
use crate::capabilities::{CapabilityGuard, TextGenerator};
use crate::error::AgentResult;
use chrono::{Duration, NaiveDate};
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};

/// Longest accepted value for a single SMART field
pub const MAX_FIELD_CHARS: usize = 280;

const PLACEHOLDERS: [&str; 8] = ["null", "none", "n/a", "na", "unknown", "tbd", "?", "-"];

pub trait SmartExtractor: Send + Sync {
    fn extract(&self, description: &str, context: &MemoryContext) -> AgentResult<SmartCriteria>;
}

// ============================================================
// VALIDATION
// ============================================================

/// Trimmed, non-empty, bounded, and not a placeholder
pub fn validate_value(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_matches('"').trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_FIELD_CHARS {
        return None;
    }
    if PLACEHOLDERS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn sanitize(draft: SmartCriteria) -> SmartCriteria {
    let mut clean = SmartCriteria::default();
    for field in SmartField::ALL {
        if let Some(value) = draft.get(field).and_then(validate_value) {
            clean.fill(field, value);
        }
    }
    clean
}

/// Clarifying question shown for an empty field
pub fn question_for(field: SmartField) -> &'static str {
    match field {
        SmartField::Specific => {
            "What exactly do you want to achieve? Can you be more specific about the outcome?"
        }
        SmartField::Measurable => {
            "How will you know when you've achieved this goal? What will success look like?"
        }
        SmartField::Achievable => {
            "What skills and resources do you currently have? What will you need to develop or acquire?"
        }
        SmartField::Relevant => {
            "How does this goal align with your career aspirations? Why is this important to you?"
        }
        SmartField::TimeBound => {
            "When do you want to achieve this goal? What's your target timeline?"
        }
    }
}

// ============================================================
// TIMELINE PARSING
// ============================================================

fn timeline_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(\d+|a|an|one|two|three|four|five|six|eight|ten|twelve|next)?\s*(day|week|month|year)s?\b",
        )
        .expect("timeline regex is valid")
    })
}

fn iso_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("date regex is valid"))
}

fn word_number(word: &str) -> Option<i64> {
    match word {
        "a" | "an" | "one" | "next" => Some(1),
        "two" => Some(2),
        "three" => Some(3),
        "four" => Some(4),
        "five" => Some(5),
        "six" => Some(6),
        "eight" => Some(8),
        "ten" => Some(10),
        "twelve" => Some(12),
        _ => word.parse().ok(),
    }
}

/// Resolve a timeline phrase to a target date
///
/// Accepts an explicit `YYYY-MM-DD` date or "N days/weeks/months/years".
/// Months count as 30 days and years as 365. A bare "months" means six
/// months. Returns `None` when nothing is recognisable.
pub fn parse_timeline(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if let Some(caps) = iso_date_regex().captures(text) {
        let (y, m, d) = (caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?);
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            return Some(date);
        }
    }

    let caps = timeline_regex().captures(text)?;
    let unit = caps[2].to_lowercase();
    let count = match caps.get(1) {
        Some(n) => word_number(&n.as_str().to_lowercase())?,
        None if unit == "month" => 6,
        None => 1,
    };
    if count <= 0 {
        return None;
    }

    let days = match unit.as_str() {
        "day" => count,
        "week" => count.checked_mul(7)?,
        "month" => count.checked_mul(30)?,
        _ => count.checked_mul(365)?,
    };
    today.checked_add_signed(Duration::try_days(days)?)
}

/// The timeline phrase itself, if the text contains one
pub fn find_timeline(text: &str) -> Option<String> {
    if let Some(m) = iso_date_regex().find(text) {
        return Some(format!("by {}", m.as_str()));
    }
    timeline_regex()
        .captures(text)
        .filter(|c| c.get(1).is_some())
        .and_then(|c| c.get(0))
        .map(|m| m.as_str().trim().to_string())
}

// ============================================================
// HEURISTIC EXTRACTOR
// ============================================================

/// Keyword-rule extractor used when no text generator is configured
pub struct HeuristicSmartExtractor;

impl HeuristicSmartExtractor {
    const SPECIFIC_INDICATORS: [&'static str; 11] = [
        "learn", "build", "complete", "earn", "get", "develop", "create", "improve", "achieve",
        "obtain", "master",
    ];
    const VAGUE_TERMS: [&'static str; 5] = ["better", "more", "good", "some", "many"];
    const MEASURABLE_TERMS: [&'static str; 12] = [
        "certificate", "job", "salary", "portfolio", "project", "course", "interview",
        "application", "skill level", "rating", "score", "certification",
    ];
    const CAREER_TERMS: [&'static str; 11] = [
        "job", "career", "skill", "promotion", "salary", "role", "position", "interview",
        "resume", "portfolio", "certification",
    ];
    const HIGH_COMPLEXITY: [&'static str; 4] = ["phd", "ceo", "expert level", "10 years experience"];

    fn words(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn specific(description: &str) -> Option<String> {
        let words = Self::words(description);
        let has_action = words
            .iter()
            .any(|w| Self::SPECIFIC_INDICATORS.contains(&w.as_str()));
        let vague = words.iter().any(|w| Self::VAGUE_TERMS.contains(&w.as_str()));
        (has_action && !vague && words.len() > 3).then(|| description.trim().to_string())
    }

    fn measurable(description: &str) -> Option<String> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"(?i)\b\d+\s+(?:[a-z+#]+\s)?[a-z+#]+").expect("measure regex is valid")
        });
        let lower = description.to_lowercase();
        let timeline = find_timeline(description).unwrap_or_default().to_lowercase();

        if let Some(m) = re.find(description) {
            let phrase = m.as_str().trim();
            if !timeline.contains(&phrase.to_lowercase()) {
                return Some(phrase.to_string());
            }
        }
        Self::MEASURABLE_TERMS
            .iter()
            .find(|t| lower.contains(*t))
            .map(|t| format!("Evidence of completion: {}", t))
    }

    fn achievable(description: &str, context: &MemoryContext) -> Option<String> {
        if context.is_empty() {
            return None;
        }
        let lower = description.to_lowercase();
        let too_big = Self::HIGH_COMPLEXITY.iter().any(|t| lower.contains(t));
        (find_timeline(description).is_some() && !too_big)
            .then(|| "Builds on prior progress recorded in memory".to_string())
    }

    fn relevant(description: &str, context: &MemoryContext) -> Option<String> {
        if context.is_empty() {
            return None;
        }
        let lower = format!("{} {}", description, context.text).to_lowercase();
        Self::CAREER_TERMS
            .iter()
            .find(|t| lower.contains(*t))
            .map(|t| format!("Advances the user's {} goals", t))
    }
}

impl SmartExtractor for HeuristicSmartExtractor {
    fn extract(&self, description: &str, context: &MemoryContext) -> AgentResult<SmartCriteria> {
        Ok(SmartCriteria {
            specific: Self::specific(description),
            measurable: Self::measurable(description),
            achievable: Self::achievable(description, context),
            relevant: Self::relevant(description, context),
            time_bound: find_timeline(description),
        })
    }
}

// ============================================================
// GENERATIVE EXTRACTOR
// ============================================================

#[derive(Debug, Default, Deserialize)]
struct RawSmart {
    specific: Option<serde_json::Value>,
    measurable: Option<serde_json::Value>,
    achievable: Option<serde_json::Value>,
    relevant: Option<serde_json::Value>,
    time_bound: Option<serde_json::Value>,
}

fn value_text(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Asks a text generator for a JSON SMART draft
pub struct GenerativeSmartExtractor {
    generator: Arc<dyn TextGenerator>,
    guard: CapabilityGuard,
    max_tokens: usize,
}

impl GenerativeSmartExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>, guard: CapabilityGuard, max_tokens: usize) -> Self {
        Self {
            generator,
            guard,
            max_tokens,
        }
    }

    fn prompt(description: &str, context: &MemoryContext) -> String {
        let mut prompt = String::from(
            "Break the user's goal into SMART criteria. Reply with a single JSON object with the \
             keys specific, measurable, achievable, relevant, time_bound. Use null for anything \
             the user has not stated.\n",
        );
        if !context.is_empty() {
            prompt.push_str("\nWhat we know about the user:\n");
            prompt.push_str(&context.text);
            prompt.push('\n');
        }
        prompt.push_str("\nGoal: ");
        prompt.push_str(description.trim());
        prompt
    }

    /// Lenient parse: take the outermost `{...}` and read known keys
    fn parse(output: &str) -> Option<SmartCriteria> {
        let trimmed = output.trim();
        let json = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => trimmed,
        };
        let raw: RawSmart = serde_json::from_str(json).ok()?;
        Some(SmartCriteria {
            specific: value_text(raw.specific),
            measurable: value_text(raw.measurable),
            achievable: value_text(raw.achievable),
            relevant: value_text(raw.relevant),
            time_bound: value_text(raw.time_bound),
        })
    }
}

impl SmartExtractor for GenerativeSmartExtractor {
    fn extract(&self, description: &str, context: &MemoryContext) -> AgentResult<SmartCriteria> {
        let output = self.guard.generate(
            &self.generator,
            &Self::prompt(description, context),
            self.max_tokens,
        )?;
        match Self::parse(&output) {
            Some(draft) => Ok(draft),
            None => {
                log::warn!("[GOALS] Failed to parse SMART draft from generator output, asking for every field");
                Ok(SmartCriteria::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MockTextGenerator;
    use std::time::Duration as StdDuration;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    #[test]
    fn test_parse_timeline_units() {
        assert_eq!(parse_timeline("6 months", today()), Some(today() + Duration::days(180)));
        assert_eq!(parse_timeline("within three weeks", today()), Some(today() + Duration::days(21)));
        assert_eq!(parse_timeline("in a year", today()), Some(today() + Duration::days(365)));
        assert_eq!(parse_timeline("10 days", today()), Some(today() + Duration::days(10)));
        assert_eq!(
            parse_timeline("by 2026-03-01", today()),
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(parse_timeline("soonish", today()), None);
    }

    #[test]
    fn test_parse_timeline_out_of_range_counts() {
        assert_eq!(parse_timeline("in 1000000000000 days", today()), None);
        assert_eq!(parse_timeline("9223372036854775807 weeks", today()), None);
        assert_eq!(parse_timeline("99999999999999999999 years", today()), None);
        assert_eq!(parse_timeline("5000000 years", today()), None);
    }

    #[test]
    fn test_validate_value() {
        assert_eq!(validate_value("  3 projects "), Some("3 projects".to_string()));
        assert_eq!(validate_value("null"), None);
        assert_eq!(validate_value("N/A"), None);
        assert_eq!(validate_value("   "), None);
        assert_eq!(validate_value(&"x".repeat(MAX_FIELD_CHARS + 1)), None);
    }

    #[test]
    fn test_heuristic_extracts_stated_fields_only() {
        let draft = HeuristicSmartExtractor
            .extract("Learn React in 6 months", &MemoryContext::default())
            .unwrap();
        assert_eq!(draft.specific.as_deref(), Some("Learn React in 6 months"));
        assert_eq!(draft.time_bound.as_deref(), Some("6 months"));
        assert!(draft.measurable.is_none());
        assert!(draft.achievable.is_none());
        assert!(draft.relevant.is_none());
    }

    #[test]
    fn test_heuristic_measurable_from_count() {
        let draft = HeuristicSmartExtractor
            .extract("Build 3 portfolio apps within 2 months", &MemoryContext::default())
            .unwrap();
        assert_eq!(draft.measurable.as_deref(), Some("3 portfolio apps"));
        assert_eq!(draft.time_bound.as_deref(), Some("2 months"));
    }

    #[test]
    fn test_generative_parses_wrapped_json() {
        let gen = MockTextGenerator::new("").with_response(
            "Sure! {\"specific\": \"Learn React\", \"measurable\": \"null\", \"achievable\": null, \
             \"relevant\": \"frontend career\", \"time_bound\": 6}",
        );
        let extractor = GenerativeSmartExtractor::new(
            Arc::new(gen),
            CapabilityGuard::new(StdDuration::from_secs(1)),
            128,
        );
        let draft = sanitize(extractor.extract("Learn React", &MemoryContext::default()).unwrap());
        assert_eq!(draft.specific.as_deref(), Some("Learn React"));
        assert_eq!(draft.relevant.as_deref(), Some("frontend career"));
        assert_eq!(draft.time_bound.as_deref(), Some("6"));
        assert!(draft.measurable.is_none());
        assert!(draft.achievable.is_none());
    }

    #[test]
    fn test_generative_garbage_becomes_empty_draft() {
        let gen = MockTextGenerator::new("I cannot help with that.");
        let extractor = GenerativeSmartExtractor::new(
            Arc::new(gen),
            CapabilityGuard::new(StdDuration::from_secs(1)),
            128,
        );
        let draft = extractor.extract("Learn React", &MemoryContext::default()).unwrap();
        assert_eq!(draft, SmartCriteria::default());
    }
}
