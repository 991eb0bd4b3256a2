use directories::ProjectDirs;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::models::{Agency, CertificateTemplate, Signature};

pub const DEFAULT_CONFIG_FILE: &str = "user_config.json";
pub const USERNAME_ENV: &str = "TAXCERT_USERNAME";
pub const PASSWORD_ENV: &str = "TAXCERT_PASSWORD";

/// Serial numbers are `calendar_year * 1000 + counter`, so the counter must
/// stay below this bound.
pub const SERIALS_PER_YEAR: u32 = 1000;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserConfig {
    pub organisation: Organisation,
    pub certification_agency: Agency,
    pub tax_certificate: TaxCertificateSettings,
    pub sources: Sources,
    #[serde(default)]
    pub groepsadmin: GroepsadminSettings,
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Organisation {
    pub general_info: Agency,
    pub certificate_signature: Signature,
    pub calendar_year: i32,
    /// Birth year of the youngest members admitted to the first age group.
    pub first_registration_year: i32,
    /// Age groups ordered from youngest to oldest.
    #[serde(alias = "takken")]
    pub age_groups: Vec<AgeGroup>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgeGroup {
    pub name: String,
    /// Number of birth years this group spans.
    pub years: i32,
    #[serde(default)]
    pub precamp: Option<Precamp>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Precamp {
    pub days: u32,
    pub surcharge: Decimal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaxCertificateSettings {
    pub template_file_name: PathBuf,
    pub next_serial_number: u32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_max_age")]
    pub max_age: i32,
    #[serde(default = "default_max_age_with_disability")]
    pub max_age_with_disability: i32,
    #[serde(default = "default_camp_activity")]
    pub camp_activity: String,
    /// Share of the price paid by a Scouting op Maat member.
    #[serde(default = "default_discount_factor")]
    pub discount_factor: Decimal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Sources {
    pub activities_sheet: PathBuf,
    pub presence_sheet: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GroepsadminSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl Default for GroepsadminSettings {
    fn default() -> Self {
        GroepsadminSettings {
            base_url: default_base_url(),
            token_url: default_token_url(),
            client_id: default_client_id(),
            username: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExportSettings {
    #[serde(default = "default_converter")]
    pub converter: String,
    #[serde(default)]
    pub keep_docx: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        ExportSettings {
            converter: default_converter(),
            keep_docx: false,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("attesten")
}

fn default_max_age() -> i32 {
    14
}

fn default_max_age_with_disability() -> i32 {
    21
}

fn default_camp_activity() -> String {
    "kamp".to_string()
}

fn default_discount_factor() -> Decimal {
    dec!(0.25)
}

fn default_base_url() -> String {
    "https://groepsadmin.scoutsengidsenvlaanderen.be/groepsadmin/rest-ga".to_string()
}

fn default_token_url() -> String {
    "https://login.scoutsengidsenvlaanderen.be/auth/realms/scouts/protocol/openid-connect/token"
        .to_string()
}

fn default_client_id() -> String {
    "groepsadmin-production-client".to_string()
}

fn default_converter() -> String {
    "soffice".to_string()
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

impl UserConfig {
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!("Attempting to load config file from {}", path.display());
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()).into());
        }

        let config_data = fs::read_to_string(path)?;
        let config: UserConfig = serde_json::from_str(&config_data)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        config.validate()?;

        tracing::debug!("Config successfully loaded from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;
        }

        let config_data = serde_json::to_string_pretty(self)?;
        fs::write(path, config_data).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;
        tracing::debug!("Config successfully saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let organisation = &self.organisation;
        if !(2000..=9999).contains(&organisation.calendar_year) {
            return Err(invalid(
                "organisation.calendar_year",
                format!("{} is not a valid year", organisation.calendar_year),
            ));
        }

        let serial = self.tax_certificate.next_serial_number;
        if serial == 0 || serial >= SERIALS_PER_YEAR {
            return Err(invalid(
                "tax_certificate.next_serial_number",
                format!("{} must be between 1 and {}", serial, SERIALS_PER_YEAR - 1),
            ));
        }

        if organisation.age_groups.is_empty() {
            return Err(invalid("organisation.age_groups", "at least one age group is required"));
        }
        let mut seen = HashSet::new();
        for group in &organisation.age_groups {
            if group.years <= 0 {
                return Err(invalid(
                    "organisation.age_groups",
                    format!("age group '{}' must span at least one year", group.name),
                ));
            }
            if !seen.insert(group.name.to_lowercase()) {
                return Err(invalid(
                    "organisation.age_groups",
                    format!("age group '{}' is listed twice", group.name),
                ));
            }
        }

        let factor = self.tax_certificate.discount_factor;
        if factor < Decimal::ZERO || factor > Decimal::ONE {
            return Err(invalid(
                "tax_certificate.discount_factor",
                format!("{} must be between 0 and 1", factor),
            ));
        }
        if self.tax_certificate.max_age <= 0 || self.tax_certificate.max_age_with_disability <= 0 {
            return Err(invalid("tax_certificate.max_age", "age limits must be positive"));
        }

        Ok(())
    }

    /// Organisation data for a run. An unset signature date becomes today.
    pub fn certificate_template(&self) -> CertificateTemplate {
        let mut signature = self.organisation.certificate_signature.clone();
        signature.date = Some(signature.signing_date());
        CertificateTemplate {
            youth_movement: self.organisation.general_info.clone(),
            certification_agency: self.certification_agency.clone(),
            signature,
        }
    }

    pub fn age_groups(&self) -> (&[AgeGroup], i32) {
        (&self.organisation.age_groups, self.organisation.first_registration_year)
    }

    pub fn calendar_year(&self) -> i32 {
        self.organisation.calendar_year
    }

    pub fn serial_start(&self) -> u32 {
        self.organisation.calendar_year as u32 * SERIALS_PER_YEAR
            + self.tax_certificate.next_serial_number
    }

    /// Advances the stored counter past the certificates issued in this run.
    pub fn record_issued(&mut self, count: u32) {
        self.tax_certificate.next_serial_number += count;
    }

    pub fn cache_path(&self) -> Result<PathBuf> {
        let dir = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => ProjectDirs::from("be", "scouting", "taxcert")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .ok_or(ConfigError::DirectoryUnavailable("cache"))?,
        };
        Ok(dir.join("members_cache.json"))
    }

    /// Asks for Groepsadmin credentials, unless they are provided through the
    /// environment.
    pub fn prompt_for_credentials(&self) -> Result<(String, String)> {
        let username = match std::env::var(USERNAME_ENV) {
            Ok(username) if !username.trim().is_empty() => username,
            _ => match &self.groepsadmin.username {
                Some(username) => username.clone(),
                None => prompt("Groepsadmin username: ")?,
            },
        };
        let password = match std::env::var(PASSWORD_ENV) {
            Ok(password) if !password.is_empty() => password,
            _ => prompt("Groepsadmin password: ")?,
        };

        if username.trim().is_empty() || password.is_empty() {
            return Err(ConfigError::MissingCredentials(
                "username and password cannot be empty".to_string(),
            )
            .into());
        }
        Ok((username.trim().to_string(), password))
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}
