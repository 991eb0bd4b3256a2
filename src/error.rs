//! Custom error types for the tax certificate generator
//!
//! Every module returns these structured errors; only the binary's top level
//! wraps them in `anyhow` for context.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the tax certificate generator
#[derive(Error, Debug)]
pub enum TaxCertError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Groepsadmin API errors
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Spreadsheet input errors
    #[error("Spreadsheet error: {0}")]
    Sheet(#[from] SheetError),

    /// Word template and PDF export errors
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to parse configuration file {}: {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("Failed to save configuration file: {0}")]
    SaveFailed(String),

    #[error("Could not determine the {0} directory")]
    DirectoryUnavailable(&'static str),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Credentials are missing: {0}")]
    MissingCredentials(String),
}

/// Groepsadmin API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication failed. Please check your username and password")]
    AuthenticationFailed,

    #[error("Not logged in to Groepsadmin")]
    NotLoggedIn,

    #[error("API request failed ({0}): {1}")]
    RequestFailed(u16, String),

    #[error("Invalid API response: {0}")]
    InvalidResponse(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Rate limit exceeded. Please try again later")]
    RateLimitExceeded,

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Spreadsheet (CSV export) errors
#[derive(Error, Debug)]
pub enum SheetError {
    #[error("Spreadsheet not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Spreadsheet is empty: {0}")]
    Empty(String),

    #[error("Invalid value '{value}' at row {row}, column {column}: {reason}")]
    InvalidCell {
        row: usize,
        column: usize,
        value: String,
        reason: String,
    },

    #[error("Failed to read spreadsheet: {0}")]
    Csv(#[from] csv::Error),
}

/// Word template and PDF export errors
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Tax certificate template '{}' not found", .0.display())]
    TemplateNotFound(PathBuf),

    #[error("Template is not a valid Word document: {0}")]
    InvalidTemplate(String),

    #[error("Failed to read or write document archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("PDF conversion failed for {}: {1}", .0.display())]
    ConversionFailed(PathBuf, String),
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid date: {0}. Expected DD/MM/YYYY")]
    InvalidDate(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Activity starts on {start} but ends on {end}")]
    InvalidActivityPeriod { start: String, end: String },

    #[error("Serial number overflow: counter {0} exceeds the yearly range")]
    SerialOverflow(u32),
}

/// Result type alias for the tax certificate generator
pub type Result<T> = std::result::Result<T, TaxCertError>;

impl From<csv::Error> for TaxCertError {
    fn from(err: csv::Error) -> Self {
        TaxCertError::Sheet(SheetError::Csv(err))
    }
}

impl From<zip::result::ZipError> for TaxCertError {
    fn from(err: zip::result::ZipError) -> Self {
        TaxCertError::Document(DocumentError::Archive(err))
    }
}

impl From<reqwest::Error> for TaxCertError {
    fn from(err: reqwest::Error) -> Self {
        TaxCertError::Api(ApiError::NetworkError(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaxCertError::Config(ConfigError::NotFound(PathBuf::from("user_config.json")));
        assert!(err.to_string().contains("user_config.json"));

        let err = TaxCertError::Validation(ValidationError::SerialOverflow(1000));
        assert!(err.to_string().contains("Serial number overflow"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TaxCertError = io_err.into();
        assert!(matches!(err, TaxCertError::Io(_)));

        let err: TaxCertError = zip::result::ZipError::FileNotFound.into();
        assert!(matches!(err, TaxCertError::Document(DocumentError::Archive(_))));
    }

    #[test]
    fn test_sheet_errors() {
        let err = SheetError::InvalidCell {
            row: 3,
            column: 2,
            value: "abc".to_string(),
            reason: "not a price".to_string(),
        };
        assert!(err.to_string().contains("row 3, column 2"));
    }
}
