use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggerMode {
    #[default]
    Operate,
    Identify,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized mode `{0}` (expected `operate` or `identify`)")]
pub struct ModeParseError(pub String);

impl LoggerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operate => "operate",
            Self::Identify => "identify",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let token = text.trim();
        if token.eq_ignore_ascii_case("operate") {
            Some(Self::Operate)
        } else if token.eq_ignore_ascii_case("identify") {
            Some(Self::Identify)
        } else {
            None
        }
    }

    pub fn uploads(self) -> bool {
        self == Self::Operate
    }
}

impl FromStr for LoggerMode {
    type Err = ModeParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text).ok_or_else(|| ModeParseError(text.to_string()))
    }
}

pub fn apply_mode_text(current: &mut LoggerMode, text: &str) -> Result<bool, ModeParseError> {
    let next = text.parse::<LoggerMode>()?;
    let changed = *current != next;
    *current = next;
    Ok(changed)
}
