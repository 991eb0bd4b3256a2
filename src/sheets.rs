//! Spreadsheet inputs, read from their CSV exports.
//!
//! The activity sheet holds one column per activity and three rows per age
//! group (start dates, end dates, prices). The presence sheet holds one row
//! per member with a mark under every activity the member attended.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::error::{Result, SheetError, TaxCertError};
use crate::models::Activity;
use crate::utils::{normalize_name, parse_price, parse_sheet_date};

const ROWS_PER_AGE_GROUP: usize = 3;
const FALSY_MARKS: [&str; 5] = ["0", "nee", "no", "n", "false"];

type Grid = Vec<Vec<String>>;

fn read_grid<R: Read>(reader: R) -> Result<Grid> {
    let mut rows = Vec::new();
    for record in csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader)
        .records()
    {
        let record = record?;
        rows.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }
    Ok(rows)
}

fn open_sheet(path: &Path) -> Result<std::fs::File> {
    if !path.exists() {
        tracing::error!("Spreadsheet '{}' not found", path.display());
        return Err(SheetError::NotFound(path.to_path_buf()).into());
    }
    Ok(std::fs::File::open(path)?)
}

fn cell(grid: &Grid, row: usize, column: usize) -> Option<&str> {
    grid.get(row)
        .and_then(|r| r.get(column))
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn invalid_cell(row: usize, column: usize, value: &str, err: TaxCertError) -> TaxCertError {
    SheetError::InvalidCell {
        row: row + 1,
        column: column + 1,
        value: value.to_string(),
        reason: err.to_string(),
    }
    .into()
}

/// Activity dates and prices per age group, kept in memory for the run.
#[derive(Debug, Clone, Default)]
pub struct ActivityCatalog {
    groups: HashMap<String, HashMap<String, Activity>>,
}

impl ActivityCatalog {
    pub fn from_path(path: &Path) -> Result<Self> {
        tracing::debug!("Reading activity data from {}", path.display());
        Self::from_reader(open_sheet(path)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let grid = read_grid(reader)?;
        let header = grid
            .first()
            .ok_or_else(|| SheetError::Empty("activity sheet has no header row".to_string()))?;
        let activities: Vec<(usize, String)> = header
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, name)| !name.is_empty())
            .map(|(column, name)| (column, name.to_lowercase()))
            .collect();
        tracing::debug!("Activities found: {:?}", activities.iter().map(|(_, n)| n).collect::<Vec<_>>());

        let mut groups = HashMap::new();
        for row in (1..grid.len()).step_by(ROWS_PER_AGE_GROUP) {
            let Some(group_name) = cell(&grid, row, 0) else {
                continue;
            };
            let mut group = HashMap::new();

            for (column, activity_name) in &activities {
                let start = cell(&grid, row, *column);
                let end = cell(&grid, row + 1, *column);
                let price = cell(&grid, row + 2, *column);

                let (Some(start), Some(end), Some(price)) = (start, end, price) else {
                    tracing::warn!(
                        "Missing activity data for age group: {} and activity: {}",
                        group_name,
                        activity_name
                    );
                    continue;
                };

                let start_date = parse_sheet_date(start).map_err(|e| invalid_cell(row, *column, start, e))?;
                let end_date = parse_sheet_date(end).map_err(|e| invalid_cell(row + 1, *column, end, e))?;
                let total = parse_price(price).map_err(|e| invalid_cell(row + 2, *column, price, e))?;
                let activity = Activity::new(start_date, end_date, total)
                    .map_err(|e| invalid_cell(row, *column, start, e))?;

                group.insert(activity_name.clone(), activity);
            }

            groups.insert(group_name.to_lowercase(), group);
        }

        Ok(ActivityCatalog { groups })
    }

    pub fn lookup(&self, age_group: &str, activity: &str) -> Option<&Activity> {
        self.groups
            .get(&age_group.to_lowercase())
            .and_then(|group| group.get(&activity.to_lowercase()))
    }

    pub fn age_groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn activity_count(&self) -> usize {
        self.groups.values().map(HashMap::len).sum()
    }
}

/// The activities one member attended, in sheet column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub name: String,
    pub activities: Vec<String>,
}

impl PresenceEntry {
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PresenceSheet {
    pub entries: Vec<PresenceEntry>,
}

fn is_present(mark: &str) -> bool {
    let mark = mark.trim().to_lowercase();
    !mark.is_empty() && !FALSY_MARKS.contains(&mark.as_str())
}

impl PresenceSheet {
    pub fn from_path(path: &Path) -> Result<Self> {
        tracing::debug!("Reading presence data from {}", path.display());
        Self::from_reader(open_sheet(path)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let grid = read_grid(reader)?;
        let header = grid
            .first()
            .ok_or_else(|| SheetError::Empty("presence sheet has no header row".to_string()))?;

        let mut entries: Vec<PresenceEntry> = Vec::new();
        for (row, values) in grid.iter().enumerate().skip(1) {
            let Some(member_name) = cell(&grid, row, 0) else {
                if values.iter().any(|v| !v.is_empty()) {
                    tracing::warn!("Skipping row {}: No member name found", row + 1);
                }
                continue;
            };

            let mut activities = Vec::new();
            for (column, mark) in values.iter().enumerate().skip(1) {
                if !is_present(mark) {
                    continue;
                }
                match header.get(column).filter(|name| !name.is_empty()) {
                    Some(activity) => activities.push(activity.to_lowercase()),
                    None => tracing::error!(
                        "Skipping column {}: No activity name found in the header",
                        column + 1
                    ),
                }
            }

            if activities.is_empty() {
                tracing::debug!("{} attended no activities", member_name);
                continue;
            }
            let entry = PresenceEntry {
                name: member_name.to_string(),
                activities,
            };
            let key = entry.key();
            match entries.iter_mut().find(|e| e.key() == key) {
                Some(existing) => {
                    tracing::warn!(
                        "Row {}: '{}' already appears as '{}', merging their activities",
                        row + 1,
                        entry.name,
                        existing.name
                    );
                    for activity in entry.activities {
                        if !existing.activities.contains(&activity) {
                            existing.activities.push(activity);
                        }
                    }
                }
                None => entries.push(entry),
            }
        }

        Ok(PresenceSheet { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }
}
