//! Word template filling and PDF export.
//!
//! A `.docx` file is a zip archive; the visible text lives in
//! `word/document.xml` and the header/footer parts. Placeholders are written
//! in the template as `{{key}}` and must not be split over several runs.
//! A table row holding `{{activity.*}}` placeholders is repeated once per
//! line item.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{DocumentError, Result};
use crate::models::{Address, Agency, CertificateTemplate, Person, TaxCertificate};
use crate::utils::{format_euro, sanitize_file_name};

const ROW_PREFIX: &str = "{{activity.";
const LINE_BREAK: &str = "</w:t><w:br/><w:t xml:space=\"preserve\">";

/// Values to substitute, plus one value map per repeated table row.
///
/// With `rows` set to `None` the activity rows are left in place for a
/// later fill; `Some(vec![])` removes them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pub values: BTreeMap<String, String>,
    pub rows: Option<Vec<BTreeMap<String, String>>>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

fn is_text_part(name: &str) -> bool {
    name == "word/document.xml"
        || (name.starts_with("word/header") || name.starts_with("word/footer")) && name.ends_with(".xml")
}

#[derive(Debug, Clone)]
pub struct DocxTemplate {
    entries: Vec<(String, Vec<u8>)>,
}

impl DocxTemplate {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::error!("Tax certificate template '{}' not found", path.display());
            return Err(DocumentError::TemplateNotFound(path.to_path_buf()).into());
        }
        Self::from_bytes(&fs::read(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            entries.push((file.name().to_string(), data));
        }

        if !entries.iter().any(|(name, _)| name == "word/document.xml") {
            return Err(DocumentError::InvalidTemplate("missing word/document.xml".to_string()).into());
        }
        Ok(DocxTemplate { entries })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in &self.entries {
            writer.start_file(name.as_str(), options)?;
            writer.write_all(data)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Placeholders still present in the text parts.
    pub fn placeholders(&self) -> Vec<String> {
        let mut found = Vec::new();
        for (name, data) in &self.entries {
            if is_text_part(name) {
                found.extend(find_placeholders(&String::from_utf8_lossy(data)));
            }
        }
        found.sort();
        found.dedup();
        found
    }

    /// Returns a copy with the fields substituted. Placeholders left over
    /// are logged; they may belong to a later phase.
    pub fn fill(&self, fields: &Fields) -> Result<DocxTemplate> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, data) in &self.entries {
            if !is_text_part(name) {
                entries.push((name.clone(), data.clone()));
                continue;
            }
            let xml = String::from_utf8(data.clone())
                .map_err(|_| DocumentError::InvalidTemplate(format!("{} is not UTF-8", name)))?;
            entries.push((name.clone(), fill_xml(&xml, fields).into_bytes()));
        }

        let filled = DocxTemplate { entries };
        let leftover = filled.placeholders();
        if !leftover.is_empty() {
            tracing::debug!("Unfilled placeholders: {}", leftover.join(", "));
        }
        Ok(filled)
    }
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
        .replace('\n', LINE_BREAK)
}

fn remove_tags(xml: &str, tag: &str) -> String {
    let mut result = String::with_capacity(xml.len());
    let mut rest = xml;
    while let Some(start) = rest.find(tag) {
        result.push_str(&rest[..start]);
        match rest[start..].find("/>") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                rest = &rest[start..];
                break;
            }
        }
    }
    result.push_str(rest);
    result
}

fn substitute(xml: &str, values: &BTreeMap<String, String>) -> String {
    values.iter().fold(xml.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{}}}}}", key), &escape_xml(value))
    })
}

/// Start of the `<w:tr>` element enclosing `pos`, if any.
fn row_start(xml: &str, pos: usize) -> Option<usize> {
    let head = &xml[..pos];
    [head.rfind("<w:tr>"), head.rfind("<w:tr ")].into_iter().flatten().max()
}

fn expand_rows(xml: &str, rows: &[BTreeMap<String, String>]) -> String {
    let mut xml = xml.to_string();
    let mut offset = 0;

    while let Some(found) = xml[offset..].find(ROW_PREFIX) {
        let pos = offset + found;
        let start = row_start(&xml, pos);
        let end = xml[pos..].find("</w:tr>").map(|e| pos + e + "</w:tr>".len());
        let (Some(start), Some(end)) = (start, end) else {
            offset = pos + ROW_PREFIX.len();
            continue;
        };

        let row_template = &xml[start..end];
        let expanded: String = rows.iter().map(|row| substitute(row_template, row)).collect();
        xml = format!("{}{}{}", &xml[..start], expanded, &xml[end..]);
        offset = start + expanded.len();
    }
    xml
}

fn fill_xml(xml: &str, fields: &Fields) -> String {
    let xml = remove_tags(xml, "<w:proofErr");
    let xml = match &fields.rows {
        Some(rows) => expand_rows(&xml, rows),
        None => xml,
    };
    substitute(&xml, &fields.values)
}

fn find_placeholders(xml: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                found.push(after[..end].to_string());
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    found
}

fn insert_address(fields: &mut Fields, prefix: &str, address: &Address) {
    fields.insert(format!("{}.street", prefix), address.street.as_str());
    fields.insert(format!("{}.street_number", prefix), address.street_number.as_str());
    fields.insert(format!("{}.zipcode", prefix), address.zipcode.as_str());
    fields.insert(format!("{}.city", prefix), address.city.as_str());
}

fn insert_agency(fields: &mut Fields, prefix: &str, agency: &Agency) {
    fields.insert(format!("{}.name", prefix), agency.name.as_str());
    fields.insert(
        format!("{}.kbo_number", prefix),
        agency.kbo_number.map(|n| n.to_string()).unwrap_or_else(|| "/".to_string()),
    );
    insert_address(fields, prefix, &agency.address);
}

fn insert_person(fields: &mut Fields, prefix: &str, person: Option<&Person>) {
    match person {
        Some(person) => {
            fields.insert(format!("{}.last_name", prefix), person.last_name.as_str());
            fields.insert(format!("{}.first_name", prefix), person.first_name.as_str());
            insert_address(fields, prefix, &person.address);
        }
        None => {
            for key in ["last_name", "first_name", "street", "street_number", "zipcode", "city"] {
                fields.insert(format!("{}.{}", prefix, key), "");
            }
        }
    }
}

/// Organisation-level fields (first phase).
pub fn organisation_fields(template: &CertificateTemplate) -> Fields {
    let mut fields = Fields::new();
    insert_agency(&mut fields, "organisation", &template.youth_movement);
    insert_agency(&mut fields, "agency", &template.certification_agency);

    let signature = &template.signature;
    fields.insert("signature.place", signature.place.as_str());
    fields.insert("signature.name", signature.name.as_str());
    fields.insert("signature.role", signature.role.as_str());
    fields.insert("signature.date", signature.signing_date().format("%d / %m / %Y").to_string());
    fields
}

/// Member-level fields (second phase).
pub fn certificate_fields(certificate: &TaxCertificate) -> Fields {
    let mut fields = Fields::new();
    fields.insert("serial_number", certificate.serial_number.to_string());
    insert_person(&mut fields, "parent", certificate.parent.as_ref());
    insert_person(&mut fields, "member", Some(&certificate.member.person));
    fields.insert(
        "member.date_of_birth",
        certificate.member.date_of_birth.format("%d/%m/%Y").to_string(),
    );

    let mut rows = Vec::with_capacity(certificate.activities.items.len());
    for item in &certificate.activities.items {
        let mut row = BTreeMap::new();
        row.insert("activity.name".to_string(), item.name.clone());
        row.insert("activity.period".to_string(), item.activity.period());
        row.insert("activity.days".to_string(), item.activity.number_of_days.to_string());
        row.insert("activity.price_per_day".to_string(), format_euro(item.activity.price_per_day));
        row.insert("activity.total".to_string(), format_euro(item.activity.total_price));
        rows.push(row);
    }
    fields.rows = Some(rows);
    fields.insert("activities.total", format_euro(certificate.activities.total));
    fields
}

/// Fills the organisation fields and saves the result as
/// `"<stem> <organisation name>.docx"` next to the template.
pub fn generate_template_file(
    template_path: &Path,
    template: &CertificateTemplate,
) -> Result<(PathBuf, DocxTemplate)> {
    let filled = DocxTemplate::open(template_path)?.fill(&organisation_fields(template))?;

    let stem = template_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "template".to_string());
    let extension = template_path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "docx".to_string());
    let file_name = sanitize_file_name(&format!("{} {}.{}", stem, template.youth_movement.name, extension));
    let output = template_path.with_file_name(file_name);

    filled.save(&output)?;
    tracing::info!("Generated tax certificate template {}", output.display());
    Ok((output, filled))
}

pub fn certificate_path(output_dir: &Path, full_name: &str, extension: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", sanitize_file_name(full_name), extension))
}

/// Like `certificate_path`, but appends the serial number when an earlier
/// certificate of the same run already took the name. Names are compared
/// case-insensitively.
pub fn unique_certificate_path(
    output_dir: &Path,
    full_name: &str,
    serial: u32,
    extension: &str,
    taken: &mut HashSet<String>,
) -> PathBuf {
    let path = certificate_path(output_dir, full_name, extension);
    if taken.insert(path.to_string_lossy().to_lowercase()) {
        return path;
    }
    tracing::warn!("{} is already written in this run, adding serial {}", path.display(), serial);
    let path = certificate_path(output_dir, &format!("{} {}", full_name, serial), extension);
    taken.insert(path.to_string_lossy().to_lowercase());
    path
}

/// Converts documents to PDF with an office suite running headless.
#[derive(Debug, Clone)]
pub struct PdfExporter {
    converter: String,
    keep_docx: bool,
}

impl PdfExporter {
    /// `converter` is a command line; extra words are passed before the
    /// conversion arguments (e.g. `flatpak run org.libreoffice.LibreOffice`).
    pub fn new(converter: &str, keep_docx: bool) -> Self {
        PdfExporter {
            converter: converter.to_string(),
            keep_docx,
        }
    }

    pub fn export(&self, docx: &Path) -> Result<PathBuf> {
        let failed = |reason: String| DocumentError::ConversionFailed(docx.to_path_buf(), reason);

        let mut words = self.converter.split_whitespace();
        let program = words.next().ok_or_else(|| failed("no converter configured".to_string()))?;
        let outdir = docx.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));

        tracing::debug!("Converting {} with {}", docx.display(), self.converter);
        let output = Command::new(program)
            .args(words)
            .args(["--headless", "--convert-to", "pdf", "--outdir"])
            .arg(outdir)
            .arg(docx)
            .output()
            .map_err(|e| failed(format!("could not run '{}': {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(failed(format!("{} ({})", output.status, stderr)).into());
        }

        let pdf = docx.with_extension("pdf");
        if !pdf.exists() {
            return Err(failed("converter produced no PDF".to_string()).into());
        }
        if !self.keep_docx {
            fs::remove_file(docx)?;
        }
        Ok(pdf)
    }
}
