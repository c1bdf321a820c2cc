//! Auto-coders ("cleaners").
//!
//! A cleaner turns raw response text into a clean value. The clean value is
//! then mapped onto a code of the scheme being auto-coded: `NC` becomes the
//! scheme's NOT_CODED code, anything else must be a match value (or string
//! value) of some code in the scheme.

use crate::scheme::{normalize_match_value, Code, CodeScheme};
use engagement_ids::CodeSchemeId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Clean value meaning "nothing recognisable".
pub const NOT_CODED_VALUE: &str = "NC";

/// Longest digit run still read as an age.
const MAX_AGE_DIGITS: usize = 3;

static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+").expect("valid digit regex")
});

/// Auto-coding failure for one message. Recovered by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutoCodingError {
    #[error("digit run '{0}' is too long to be an age")]
    NumberTooLong(String),

    #[error("clean value '{value}' has no code in scheme '{scheme_id}'")]
    UnmappedValue {
        value: String,
        scheme_id: CodeSchemeId,
    },

    #[error("scheme '{0}' has no NOT_CODED code")]
    MissingNotCoded(CodeSchemeId),
}

/// Output of a cleaner before it is mapped to a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanValue {
    NotCoded,
    Value(String),
}

impl fmt::Display for CleanValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanValue::NotCoded => f.write_str(NOT_CODED_VALUE),
            CleanValue::Value(v) => f.write_str(v),
        }
    }
}

/// Closed set of auto-coders, configured as data.
///
/// ```toml
/// auto_coder = { type = "age", min = 10, max = 99 }
/// auto_coder = { type = "gender" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cleaner {
    Age { min: u32, max: u32 },
    Gender,
    YesNo,
    SchemeMatch,
}

impl fmt::Display for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cleaner::Age { min, max } => write!(f, "age[{}..={}]", min, max),
            Cleaner::Gender => f.write_str("gender"),
            Cleaner::YesNo => f.write_str("yes_no"),
            Cleaner::SchemeMatch => f.write_str("scheme_match"),
        }
    }
}

impl Cleaner {
    /// Run the cleaner on raw text.
    pub fn clean(&self, text: &str, scheme: &CodeScheme) -> Result<CleanValue, AutoCodingError> {
        match self {
            Cleaner::Age { min, max } => Ok(match extract_age(text)? {
                Some(age) if age >= *min && age <= *max => CleanValue::Value(age.to_string()),
                _ => CleanValue::NotCoded,
            }),
            Cleaner::Gender => Ok(classify(text, MALE_WORDS, "male", FEMALE_WORDS, "female")),
            Cleaner::YesNo => Ok(classify(text, YES_WORDS, "yes", NO_WORDS, "no")),
            Cleaner::SchemeMatch => Ok(match_scheme(text, scheme)),
        }
    }

    /// Clean `text` and map the result onto a code of `scheme`.
    pub fn auto_code<'s>(
        &self,
        text: &str,
        scheme: &'s CodeScheme,
    ) -> Result<&'s Code, AutoCodingError> {
        let value = self.clean(text, scheme)?;
        code_for_clean_value(&value, scheme)
    }
}

/// Map a clean value onto `scheme`.
pub fn code_for_clean_value<'s>(
    value: &CleanValue,
    scheme: &'s CodeScheme,
) -> Result<&'s Code, AutoCodingError> {
    match value {
        CleanValue::NotCoded => scheme
            .not_coded()
            .ok_or_else(|| AutoCodingError::MissingNotCoded(scheme.scheme_id().clone())),
        CleanValue::Value(v) => scheme
            .code_for_match_value(v)
            .or_else(|| scheme.code_for_string_value(v))
            .ok_or_else(|| AutoCodingError::UnmappedValue {
                value: v.clone(),
                scheme_id: scheme.scheme_id().clone(),
            }),
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

const MALE_WORDS: &[&str] = &["male", "man", "m", "boy", "lab", "wiil", "nin", "rag", "ragga"];
const FEMALE_WORDS: &[&str] = &[
    "female", "woman", "f", "girl", "dhedig", "naag", "gabar", "haweeney", "dumar",
];
const YES_WORDS: &[&str] = &["yes", "y", "yeah", "yep", "haa", "haan", "ha"];
const NO_WORDS: &[&str] = &["no", "n", "nope", "maya", "may", "mayo"];

/// Two-way token classifier; both or neither present is NC.
fn classify(
    text: &str,
    first: &[&str],
    first_value: &str,
    second: &[&str],
    second_value: &str,
) -> CleanValue {
    let toks = tokens(text);
    let has_first = toks.iter().any(|t| first.contains(&t.as_str()));
    let has_second = toks.iter().any(|t| second.contains(&t.as_str()));
    match (has_first, has_second) {
        (true, false) => CleanValue::Value(first_value.to_string()),
        (false, true) => CleanValue::Value(second_value.to_string()),
        _ => CleanValue::NotCoded,
    }
}

fn english_unit(word: &str) -> Option<u32> {
    Some(match word {
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        _ => return None,
    })
}

fn english_tens(word: &str) -> Option<u32> {
    Some(match word {
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    })
}

fn somali_unit(word: &str) -> Option<u32> {
    Some(match word {
        "kow" | "hal" => 1,
        "laba" => 2,
        "saddex" => 3,
        "afar" => 4,
        "shan" => 5,
        "lix" => 6,
        "toddoba" => 7,
        "siddeed" => 8,
        "sagaal" => 9,
        _ => return None,
    })
}

fn somali_tens(word: &str) -> Option<u32> {
    Some(match word {
        "toban" => 10,
        "labaatan" => 20,
        "soddon" => 30,
        "afartan" => 40,
        "konton" => 50,
        "lixdan" => 60,
        "toddobaatan" => 70,
        "siddeetan" => 80,
        "sagaashan" => 90,
        _ => return None,
    })
}

/// Integer age from text. Digits take precedence over number words.
fn extract_age(text: &str) -> Result<Option<u32>, AutoCodingError> {
    if let Some(run) = DIGIT_RUN.find(text) {
        let digits = run.as_str();
        if digits.len() > MAX_AGE_DIGITS {
            return Err(AutoCodingError::NumberTooLong(digits.to_string()));
        }
        return Ok(digits.parse().ok());
    }

    let mut tens = None;
    let mut units = None;
    for token in tokens(text) {
        if let Some(value) = english_tens(&token).or_else(|| somali_tens(&token)) {
            tens.get_or_insert(value);
        } else if let Some(value) = english_unit(&token).or_else(|| somali_unit(&token)) {
            units.get_or_insert(value);
        }
    }

    Ok(match (tens, units) {
        (None, None) => None,
        (Some(t), None) => Some(t),
        (None, Some(u)) => Some(u),
        // "twenty five", "shan iyo labaatan"
        (Some(t), Some(u)) if u < 10 => Some(t + u),
        (Some(t), Some(_)) => Some(t),
    })
}

/// Whole text first, then tokens and bigrams. Ambiguous matches are NC.
fn match_scheme(text: &str, scheme: &CodeScheme) -> CleanValue {
    let whole = normalize_match_value(text);
    if whole.is_empty() {
        return CleanValue::NotCoded;
    }
    if scheme.code_for_match_value(&whole).is_some() {
        return CleanValue::Value(whole);
    }

    let toks = tokens(text);
    let mut candidates: Vec<String> = toks.windows(2).map(|pair| pair.join(" ")).collect();
    candidates.extend(toks.iter().cloned());

    let mut found: Option<(String, &Code)> = None;
    for candidate in candidates {
        if let Some(code) = scheme.code_for_match_value(&candidate) {
            let conflicting = found
                .as_ref()
                .map(|(_, existing)| existing.code_id != code.code_id);
            match conflicting {
                Some(true) => return CleanValue::NotCoded,
                Some(false) => {}
                None => found = Some((candidate, code)),
            }
        }
    }

    match found {
        Some((value, _)) => CleanValue::Value(value),
        None => CleanValue::NotCoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::test_support::*;
    use crate::ControlCode;

    fn age_scheme() -> CodeScheme {
        let mut codes: Vec<Code> = (10..=99)
            .map(|age| {
                let mut code = normal(&format!("age-{}", age), &age.to_string(), &[]);
                code.numeric_value = Some(age);
                code
            })
            .collect();
        codes.push(control("age-nc", ControlCode::NotCoded));
        scheme("age", codes)
    }

    fn gender_scheme() -> CodeScheme {
        scheme(
            "gender",
            vec![
                normal("g-male", "male", &["male"]),
                normal("g-female", "female", &["female"]),
                control("g-nc", ControlCode::NotCoded),
            ],
        )
    }

    #[test]
    fn test_age_digits_and_words() {
        assert_eq!(extract_age("I am 23 years").unwrap(), Some(23));
        assert_eq!(extract_age("twenty five").unwrap(), Some(25));
        assert_eq!(extract_age("shan iyo labaatan").unwrap(), Some(25));
        assert_eq!(extract_age("fifteen").unwrap(), Some(15));
        assert_eq!(extract_age("no idea").unwrap(), None);
    }

    #[test]
    fn test_age_long_digit_run_is_error() {
        let scheme = age_scheme();
        let cleaner = Cleaner::Age { min: 10, max: 99 };
        let err = cleaner.auto_code("252615000000", &scheme).unwrap_err();
        assert!(matches!(err, AutoCodingError::NumberTooLong(_)));
    }

    #[test]
    fn test_age_out_of_range_is_not_coded() {
        let scheme = age_scheme();
        let cleaner = Cleaner::Age { min: 10, max: 99 };
        assert_eq!(cleaner.auto_code("age 7", &scheme).unwrap().code_id.as_str(), "age-nc");
        assert_eq!(cleaner.auto_code("age 37", &scheme).unwrap().code_id.as_str(), "age-37");
    }

    #[test]
    fn test_gender_variants() {
        let scheme = gender_scheme();
        assert_eq!(
            Cleaner::Gender.auto_code("Waxaan ahay wiil", &scheme).unwrap().string_value,
            "male"
        );
        assert_eq!(
            Cleaner::Gender.auto_code("FEMALE", &scheme).unwrap().string_value,
            "female"
        );
        assert_eq!(
            Cleaner::Gender.auto_code("man and woman", &scheme).unwrap().string_value,
            "NC"
        );
    }

    #[test]
    fn test_yes_no() {
        let scheme = scheme(
            "yes_no",
            vec![
                normal("yes", "yes", &[]),
                normal("no", "no", &[]),
                control("nc", ControlCode::NotCoded),
            ],
        );
        assert_eq!(Cleaner::YesNo.auto_code("Haa", &scheme).unwrap().string_value, "yes");
        assert_eq!(Cleaner::YesNo.auto_code("maya!", &scheme).unwrap().string_value, "no");
        assert_eq!(Cleaner::YesNo.auto_code("maybe", &scheme).unwrap().string_value, "NC");
    }

    #[test]
    fn test_scheme_match_tokens_and_bigrams() {
        let scheme = scheme(
            "district",
            vec![
                normal("d-hodan", "hodan", &["hodan"]),
                normal("d-wadajir", "wadajir", &["wadajir", "medina"]),
                normal("d-bosaso", "bosaso", &["bosaso", "bari region"]),
                control("d-nc", ControlCode::NotCoded),
            ],
        );
        let cleaner = Cleaner::SchemeMatch;
        assert_eq!(cleaner.auto_code("Hodan", &scheme).unwrap().code_id.as_str(), "d-hodan");
        assert_eq!(
            cleaner.auto_code("I live in Medina", &scheme).unwrap().code_id.as_str(),
            "d-wadajir"
        );
        assert_eq!(
            cleaner.auto_code("from bari region", &scheme).unwrap().code_id.as_str(),
            "d-bosaso"
        );
        assert_eq!(
            cleaner.auto_code("hodan or wadajir", &scheme).unwrap().code_id.as_str(),
            "d-nc"
        );
    }

    #[test]
    fn test_unmapped_clean_value_is_error() {
        let scheme = scheme(
            "partial",
            vec![normal("m", "male", &[]), control("nc", ControlCode::NotCoded)],
        );
        let err = Cleaner::Gender.auto_code("female", &scheme).unwrap_err();
        assert!(matches!(err, AutoCodingError::UnmappedValue { .. }));
    }

    #[test]
    fn test_missing_not_coded() {
        let scheme = scheme("bare", vec![normal("m", "male", &[])]);
        let err = Cleaner::Gender.auto_code("unknown", &scheme).unwrap_err();
        assert!(matches!(err, AutoCodingError::MissingNotCoded(_)));
    }

    #[test]
    fn test_cleaner_config_serde() {
        let cleaner: Cleaner = serde_json::from_str(r#"{"type": "age", "min": 10, "max": 99}"#).unwrap();
        assert_eq!(cleaner, Cleaner::Age { min: 10, max: 99 });
        let cleaner: Cleaner = serde_json::from_str(r#"{"type": "scheme_match"}"#).unwrap();
        assert_eq!(cleaner, Cleaner::SchemeMatch);
    }
}
