use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::MemberRecord;
use crate::utils::normalize_name;

/// A member record as fetched from Groepsadmin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedMember {
    pub record: MemberRecord,
    pub fetched_at: String, // RFC 3339 timestamp
}

/// On-disk cache of member records keyed by Groepsadmin id, so runs can
/// be repeated without logging in again
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberCache {
    pub members: HashMap<String, CachedMember>,
    pub last_updated: String, // RFC 3339 timestamp
    #[serde(skip)]
    path: PathBuf,
}

impl MemberCache {
    /// Create a new empty cache stored at `path`
    pub fn new(path: PathBuf) -> Self {
        MemberCache {
            members: HashMap::new(),
            last_updated: Local::now().to_rfc3339(),
            path,
        }
    }

    /// Load cache from disk; a missing file yields an empty cache
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No member cache at {}", path.display());
            return Ok(Self::new(path.to_path_buf()));
        }

        let cache_data = fs::read_to_string(path)?;
        let mut cache: MemberCache = serde_json::from_str(&cache_data)?;
        cache.path = path.to_path_buf();
        Ok(cache)
    }

    /// Save cache to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let cache_data = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, cache_data)?;
        tracing::debug!("Saved {} members to {}", self.members.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or replace records fetched in this run
    pub fn update_from_records(&mut self, records: &[MemberRecord]) {
        let now = Local::now().to_rfc3339();
        for record in records {
            self.members.insert(
                record.id.clone(),
                CachedMember {
                    record: record.clone(),
                    fetched_at: now.clone(),
                },
            );
        }
        self.last_updated = now;
    }

    /// Find a member by full name, using the same normalisation as the
    /// presence sheet
    pub fn get_by_name(&self, name: &str) -> Option<&MemberRecord> {
        let key = normalize_name(name);
        self.members
            .values()
            .map(|cached| &cached.record)
            .find(|record| normalize_name(&record.member.full_name()) == key)
    }

    /// All cached records sorted by name
    pub fn records(&self) -> Vec<MemberRecord> {
        let mut records: Vec<MemberRecord> = self.members.values().map(|c| c.record.clone()).collect();
        records.sort_by_key(|r| normalize_name(&r.member.full_name()));
        records
    }

    /// Check if cache is stale (older than specified hours)
    pub fn is_stale(&self, hours: i64) -> bool {
        if let Ok(last_updated) = DateTime::parse_from_rfc3339(&self.last_updated) {
            let now = Local::now();
            let duration = now.signed_duration_since(last_updated);
            duration.num_hours() > hours
        } else {
            true // If we can't parse the date, consider it stale
        }
    }

    /// Clear all cached members
    pub fn clear(&mut self) {
        self.members.clear();
        self.last_updated = Local::now().to_rfc3339();
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
