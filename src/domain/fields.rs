//! Typed views of well-known payload fields
//!
//! The service sends priorities and colors as bare integers. These enums map
//! them to names the CLI and plugins can work with. Unknown wire values are
//! treated as absent rather than as errors.
//!
//! [`DueDate`] and [`FieldError`] cover validation of locally made changes
//! before they are queued.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::entity::EntityKind;

/// A field value the service would refuse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("a new {kind} needs '{field}'")]
    Missing { kind: EntityKind, field: &'static str },

    #[error("'{field}' of a {kind} cannot be cleared")]
    Cleared { kind: EntityKind, field: &'static str },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid_due(reason: impl Into<String>) -> FieldError {
    FieldError::Invalid {
        field: "due",
        reason: reason.into(),
    }
}

/// Priority of an item
///
/// Clients show `p1` as the most urgent, but the API encodes it as 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P1,
    P2,
    P3,
    #[default]
    P4,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::P1, Priority::P2, Priority::P3, Priority::P4];

    /// Value used on the wire
    pub fn wire_value(self) -> u8 {
        match self {
            Priority::P1 => 4,
            Priority::P2 => 3,
            Priority::P3 => 2,
            Priority::P4 => 1,
        }
    }

    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            4 => Some(Priority::P1),
            3 => Some(Priority::P2),
            2 => Some(Priority::P3),
            1 => Some(Priority::P4),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P1 => "p1",
            Priority::P2 => "p2",
            Priority::P3 => "p3",
            Priority::P4 => "p4",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p1" => Ok(Priority::P1),
            "p2" => Ok(Priority::P2),
            "p3" => Ok(Priority::P3),
            "p4" => Ok(Priority::P4),
            other => Err(format!("Unknown priority '{}'. Use p1, p2, p3 or p4.", other)),
        }
    }
}

/// Named colors for projects, labels and filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    BerryRed,
    Red,
    Orange,
    Yellow,
    OliveGreen,
    LimeGreen,
    Green,
    MintGreen,
    Teal,
    SkyBlue,
    LightBlue,
    Blue,
    Grape,
    Violet,
    Lavender,
    Magenta,
    Salmon,
    Charcoal,
    #[default]
    Grey,
    Taupe,
}

impl Color {
    const ORDERED: [Color; 20] = [
        Color::BerryRed,
        Color::Red,
        Color::Orange,
        Color::Yellow,
        Color::OliveGreen,
        Color::LimeGreen,
        Color::Green,
        Color::MintGreen,
        Color::Teal,
        Color::SkyBlue,
        Color::LightBlue,
        Color::Blue,
        Color::Grape,
        Color::Violet,
        Color::Lavender,
        Color::Magenta,
        Color::Salmon,
        Color::Charcoal,
        Color::Grey,
        Color::Taupe,
    ];

    /// First wire value; colors are numbered consecutively from here
    const WIRE_BASE: u64 = 30;

    pub fn wire_value(self) -> u64 {
        let index = Self::ORDERED
            .iter()
            .position(|c| *c == self)
            .unwrap_or_default();
        Self::WIRE_BASE + index as u64
    }

    pub fn from_wire(value: u64) -> Option<Self> {
        let index = value.checked_sub(Self::WIRE_BASE)?;
        Self::ORDERED.get(index as usize).copied()
    }
}

/// Languages the service parses due strings in
pub const DUE_LANGS: [&str; 14] = [
    "en", "da", "pl", "zh", "ko", "de", "pt", "ja", "it", "fr", "sv", "ru", "es", "nl",
];

/// Due date of an item
///
/// `date` is `YYYY-MM-DD` for full-day dates or `YYYY-MM-DDTHH:MM:SS`
/// (optionally with a trailing `Z`) for timed ones. `string` is the
/// human-readable form the service parses in `lang`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueDate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,

    #[serde(default = "DueDate::default_lang")]
    pub lang: String,

    #[serde(default)]
    pub is_recurring: bool,
}

impl DueDate {
    fn default_lang() -> String {
        "en".to_string()
    }

    /// A full-day due date
    pub fn on(day: NaiveDate) -> Self {
        Self {
            date: Some(day.format("%Y-%m-%d").to_string()),
            timezone: None,
            string: None,
            lang: Self::default_lang(),
            is_recurring: false,
        }
    }

    /// Decodes and validates a `due` field value
    pub fn parse(value: &serde_json::Value) -> Result<Self, FieldError> {
        let due: DueDate =
            serde_json::from_value(value.clone()).map_err(|e| invalid_due(e.to_string()))?;
        due.validate()?;
        Ok(due)
    }

    pub fn validate(&self) -> Result<(), FieldError> {
        if !DUE_LANGS.contains(&self.lang.as_str()) {
            return Err(invalid_due(format!("unsupported language '{}'", self.lang)));
        }
        match (&self.date, &self.string) {
            (None, None) => return Err(invalid_due("needs a date or a string")),
            (Some(date), _) if parse_due(date).is_none() => {
                return Err(invalid_due(format!("'{}' is not a date", date)));
            }
            _ => {}
        }
        if self.is_recurring && self.string.is_none() {
            return Err(invalid_due("a recurring due date needs a string"));
        }
        Ok(())
    }

    /// Calendar day the item is due, if the date is set
    pub fn day(&self) -> Option<NaiveDate> {
        self.date.as_deref().and_then(parse_due).map(|dt| dt.date())
    }
}

fn parse_due(value: &str) -> Option<NaiveDateTime> {
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return day.and_hms_opt(0, 0, 0);
    }
    NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S").ok()
}
