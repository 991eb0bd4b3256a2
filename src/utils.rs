use chrono::prelude::*;
use chrono::Months;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::{Result, ValidationError};

/// Utility functions for the tax certificate generator

// ===== STRING UTILITIES =====

/// Masks a token for safe logging (shows first 4 characters, masks the rest)
pub fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    let hidden = token.chars().count().saturating_sub(4);
    if hidden == 0 {
        "*".repeat(visible.chars().count())
    } else {
        format!("{}{}", visible, "*".repeat(hidden))
    }
}

/// Truncates a string to a maximum number of characters, adding "..." if truncated
pub fn truncate_string(s: &str, max_length: usize) -> String {
    if s.chars().count() <= max_length {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_length.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Key used to join member names across the API and the spreadsheets:
/// lowercased, with runs of whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Strips characters that are not allowed in file names.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect::<String>()
        .trim()
        .to_string()
}

// ===== DATE/TIME UTILITIES =====

/// Parses a spreadsheet date in the format `DD/MM/YYYY`, optionally prefixed
/// with a weekday (`"Vrijdag, 23/02/2024"`).
pub fn parse_sheet_date(raw: &str) -> Result<NaiveDate> {
    let value = raw.rsplit(',').next().unwrap_or(raw).trim();
    NaiveDate::parse_from_str(value, "%d/%m/%Y")
        .map_err(|_| ValidationError::InvalidDate(raw.to_string()).into())
}

/// Age in completed years on `reference`. A birthday on 29 February falls
/// on 28 February in common years.
pub fn age_on(date_of_birth: NaiveDate, reference: NaiveDate) -> i32 {
    let years = reference.year() - date_of_birth.year();
    let birthday = date_of_birth.checked_add_months(Months::new(12 * years.max(0) as u32));
    match birthday {
        Some(birthday) if birthday <= reference => years,
        _ => years - 1,
    }
}

/// Serde adapter for optional `DD/MM/YYYY` dates in the user configuration.
/// A missing, null or blank value reads as `None`.
pub mod certificate_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(date) => serializer.serialize_str(&date.format("%d/%m/%Y").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = match Option::<String>::deserialize(deserializer)? {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => return Ok(None),
        };
        NaiveDate::parse_from_str(raw.trim(), "%d/%m/%Y")
            .or_else(|_| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d"))
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid date '{}'", raw)))
    }
}

/// Formats a duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() > 0 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if duration.as_millis() > 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}μs", duration.as_micros())
    }
}

// ===== MONEY UTILITIES =====

/// Parses a spreadsheet price such as `50`, `50.00`, `€ 16,50` or `1.250,00`.
pub fn parse_price(raw: &str) -> Result<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '€')
        .collect();

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // Decimal comma with dots as thousands separators
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        // Decimal dot with commas as thousands separators
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    Decimal::from_str(&normalized).map_err(|_| ValidationError::InvalidPrice(raw.to_string()).into())
}

/// Formats an amount the Belgian way: `€ 16,67`.
pub fn format_euro(amount: Decimal) -> String {
    let rounded = crate::models::round_cents(amount);
    format!("€ {}", format!("{:.2}", rounded).replace('.', ","))
}

// ===== PERFORMANCE UTILITIES =====

/// A simple timer for performance measurement
pub struct Timer {
    start: Instant,
    message: String,
}

impl Timer {
    /// Creates a new timer with a message
    pub fn new(message: &str) -> Self {
        Timer {
            start: Instant::now(),
            message: message.to_string(),
        }
    }

    /// Stops the timer and returns a formatted message
    pub fn stop_with_message(self) -> String {
        let duration = self.start.elapsed();
        format!("{} took {}", self.message, format_duration(duration))
    }
}
