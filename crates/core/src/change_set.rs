//! Change set reasons and input validation.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of a change set description.
pub const MAX_DESCRIPTION_LEN: usize = 2000;

/// Why a group of changes was proposed. A change set may carry several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Correction,
    Addition,
    Removal,
    Citation,
    Formatting,
    Translation,
    Other,
}

impl ChangeReason {
    pub const ALL: &'static [ChangeReason] = &[
        Self::Correction,
        Self::Addition,
        Self::Removal,
        Self::Citation,
        Self::Formatting,
        Self::Translation,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correction => "correction",
            Self::Addition => "addition",
            Self::Removal => "removal",
            Self::Citation => "citation",
            Self::Formatting => "formatting",
            Self::Translation => "translation",
            Self::Other => "other",
        }
    }

    pub fn parse(label: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == label)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Invalid change reason '{label}'. Must be one of: {}",
                    Self::ALL.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", ")
                ))
            })
    }
}

/// Parse stored reason labels, rejecting unknown values.
pub fn parse_reasons(labels: &[String]) -> Result<Vec<ChangeReason>, CoreError> {
    labels.iter().map(|l| ChangeReason::parse(l)).collect()
}

/// Validate change set input: at least one reason, no duplicates, and a
/// bounded description.
pub fn validate_change_set(reasons: &[ChangeReason], description: &str) -> Result<(), CoreError> {
    if reasons.is_empty() {
        return Err(CoreError::Validation(
            "A change set needs at least one reason".to_string(),
        ));
    }
    for (i, reason) in reasons.iter().enumerate() {
        if reasons[..i].contains(reason) {
            return Err(CoreError::Validation(format!(
                "Duplicate change reason '{}'",
                reason.as_str()
            )));
        }
    }
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(CoreError::Validation(format!(
            "Description exceeds {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(())
}
