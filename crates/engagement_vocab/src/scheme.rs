//! Code schemes: immutable controlled vocabularies.
//!
//! Schemes are stored on disk in the coding tool's JSON layout
//! (`SchemeID`, `Codes[].CodeID`, `MatchValues`, ...). Parsing validates the
//! scheme and builds lookup indices, so a `CodeScheme` value is always valid.

use crate::error::VocabError;
use engagement_ids::{CodeId, CodeSchemeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Control codes record why a message has no normal code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControlCode {
    #[serde(rename = "NC")]
    NotCoded,
    #[serde(rename = "NR")]
    NotReviewed,
    #[serde(rename = "WS")]
    WrongScheme,
    #[serde(rename = "CE")]
    CodingError,
    #[serde(rename = "NIC")]
    NotInternallyConsistent,
    #[serde(rename = "NL")]
    NotLogical,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "TRUE_MISSING")]
    TrueMissing,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "NOC")]
    NoiseOtherChannel,
}

impl ControlCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCode::NotCoded => "NC",
            ControlCode::NotReviewed => "NR",
            ControlCode::WrongScheme => "WS",
            ControlCode::CodingError => "CE",
            ControlCode::NotInternallyConsistent => "NIC",
            ControlCode::NotLogical => "NL",
            ControlCode::Stop => "STOP",
            ControlCode::TrueMissing => "TRUE_MISSING",
            ControlCode::Skipped => "SKIPPED",
            ControlCode::NoiseOtherChannel => "NOC",
        }
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeType {
    Normal,
    Control,
    Meta,
}

/// One entry of a code scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    #[serde(rename = "CodeID")]
    pub code_id: CodeId,
    #[serde(rename = "DisplayText")]
    pub display_text: String,
    #[serde(rename = "StringValue")]
    pub string_value: String,
    #[serde(rename = "NumericValue", default)]
    pub numeric_value: Option<i64>,
    #[serde(rename = "CodeType")]
    pub code_type: CodeType,
    #[serde(rename = "ControlCode", default, skip_serializing_if = "Option::is_none")]
    pub control_code: Option<ControlCode>,
    #[serde(rename = "MatchValues", default, skip_serializing_if = "Vec::is_empty")]
    pub match_values: Vec<String>,
}

impl Code {
    pub fn is_control(&self) -> bool {
        self.code_type == CodeType::Control
    }
}

/// Lowercase and collapse internal whitespace.
pub fn normalize_match_value(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCodeScheme {
    #[serde(rename = "SchemeID")]
    scheme_id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Version", default)]
    version: String,
    #[serde(rename = "Codes")]
    codes: Vec<Code>,
}

/// A validated, immutable code scheme.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawCodeScheme")]
pub struct CodeScheme {
    scheme_id: CodeSchemeId,
    name: String,
    version: String,
    codes: Vec<Code>,
    by_id: HashMap<CodeId, usize>,
    by_control: HashMap<ControlCode, usize>,
    by_match: HashMap<String, usize>,
    by_string: HashMap<String, usize>,
}

impl TryFrom<RawCodeScheme> for CodeScheme {
    type Error = VocabError;

    fn try_from(raw: RawCodeScheme) -> Result<Self, Self::Error> {
        let scheme_id = CodeSchemeId::parse(&raw.scheme_id)
            .map_err(|e| VocabError::invalid(&raw.scheme_id, e.to_string()))?;
        CodeScheme::new(scheme_id, raw.name, raw.version, raw.codes)
    }
}

impl CodeScheme {
    /// Build and validate a scheme.
    pub fn new(
        scheme_id: CodeSchemeId,
        name: impl Into<String>,
        version: impl Into<String>,
        codes: Vec<Code>,
    ) -> Result<Self, VocabError> {
        let sid = scheme_id.as_str().to_string();
        if codes.is_empty() {
            return Err(VocabError::invalid(&sid, "scheme has no codes"));
        }

        let mut by_id = HashMap::new();
        let mut by_control = HashMap::new();
        let mut by_match: HashMap<String, usize> = HashMap::new();
        let mut by_string = HashMap::new();

        for (idx, code) in codes.iter().enumerate() {
            if by_id.insert(code.code_id.clone(), idx).is_some() {
                return Err(VocabError::invalid(
                    &sid,
                    format!("duplicate code id '{}'", code.code_id),
                ));
            }
            if by_string.insert(code.string_value.clone(), idx).is_some() {
                return Err(VocabError::invalid(
                    &sid,
                    format!("duplicate string value '{}'", code.string_value),
                ));
            }

            match (code.code_type, code.control_code) {
                (CodeType::Control, None) => {
                    return Err(VocabError::invalid(
                        &sid,
                        format!("control code '{}' has no ControlCode", code.code_id),
                    ))
                }
                (CodeType::Control, Some(control)) => {
                    if by_control.insert(control, idx).is_some() {
                        return Err(VocabError::invalid(
                            &sid,
                            format!("control code {} defined twice", control),
                        ));
                    }
                }
                (_, Some(_)) => {
                    return Err(VocabError::invalid(
                        &sid,
                        format!("non-control code '{}' carries a ControlCode", code.code_id),
                    ))
                }
                (_, None) => {}
            }

            for value in &code.match_values {
                let key = normalize_match_value(value);
                if key.is_empty() {
                    continue;
                }
                match by_match.get(&key) {
                    Some(&other) if other != idx => {
                        return Err(VocabError::invalid(
                            &sid,
                            format!(
                                "match value '{}' shared by '{}' and '{}'",
                                key, codes[other].code_id, code.code_id
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        by_match.insert(key, idx);
                    }
                }
            }
        }

        Ok(Self {
            scheme_id,
            name: name.into(),
            version: version.into(),
            codes,
            by_id,
            by_control,
            by_match,
            by_string,
        })
    }

    pub fn scheme_id(&self) -> &CodeSchemeId {
        &self.scheme_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn codes(&self) -> &[Code] {
        &self.codes
    }

    pub fn code(&self, code_id: &CodeId) -> Option<&Code> {
        self.by_id.get(code_id).map(|&idx| &self.codes[idx])
    }

    pub fn control_code(&self, control: ControlCode) -> Option<&Code> {
        self.by_control.get(&control).map(|&idx| &self.codes[idx])
    }

    /// The `NC` code, if the scheme has one.
    pub fn not_coded(&self) -> Option<&Code> {
        self.control_code(ControlCode::NotCoded)
    }

    /// Case-insensitive, whitespace-normalised match value lookup.
    pub fn code_for_match_value(&self, value: &str) -> Option<&Code> {
        self.by_match
            .get(&normalize_match_value(value))
            .map(|&idx| &self.codes[idx])
    }

    pub fn code_for_string_value(&self, value: &str) -> Option<&Code> {
        self.by_string.get(value).map(|&idx| &self.codes[idx])
    }
}

impl PartialEq for CodeScheme {
    fn eq(&self, other: &Self) -> bool {
        self.scheme_id == other.scheme_id
            && self.version == other.version
            && self.codes == other.codes
    }
}
