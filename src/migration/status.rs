use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{LedgerEntry, Migration};

/// Where a migration stands relative to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Recorded, and the file still matches its checksum.
    Applied,
    /// Present on disk, not yet recorded.
    Pending,
    /// Recorded, but the file no longer matches the stored checksum.
    Modified,
    /// Recorded, but no file carries that version any more.
    Missing,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MigrationState::Applied => "applied",
            MigrationState::Pending => "pending",
            MigrationState::Modified => "modified",
            MigrationState::Missing => "missing",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: u32,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Merge discovered migrations with ledger rows, ascending by version.
pub fn compute(migrations: &[Migration], applied: &BTreeMap<u32, LedgerEntry>) -> Vec<MigrationStatus> {
    let mut statuses: Vec<MigrationStatus> = migrations
        .iter()
        .map(|migration| match applied.get(&migration.version) {
            Some(entry) => MigrationStatus {
                version: migration.version,
                name: migration.name.clone(),
                state: if migration.verify(&entry.checksum).is_some() {
                    MigrationState::Applied
                } else {
                    MigrationState::Modified
                },
                applied_at: Some(entry.applied_at),
            },
            None => MigrationStatus {
                version: migration.version,
                name: migration.name.clone(),
                state: MigrationState::Pending,
                applied_at: None,
            },
        })
        .collect();

    statuses.extend(
        applied
            .values()
            .filter(|entry| !migrations.iter().any(|m| m.version == entry.version))
            .map(|entry| MigrationStatus {
                version: entry.version,
                name: entry.name.clone(),
                state: MigrationState::Missing,
                applied_at: Some(entry.applied_at),
            }),
    );

    statuses.sort_by_key(|status| status.version);
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::checksum::checksum;

    fn migration(version: u32, name: &str, script: &str) -> Migration {
        Migration {
            version,
            name: name.to_string(),
            script: script.to_string(),
            filename: format!("{version:04}_{name}.sql"),
        }
    }

    fn entry(version: u32, name: &str, sum: String) -> LedgerEntry {
        LedgerEntry {
            version,
            name: name.to_string(),
            applied_at: Utc::now(),
            checksum: sum,
        }
    }

    #[test]
    fn test_compute_every_state() {
        let migrations = vec![
            migration(1, "users", "CREATE TABLE users (id INTEGER);"),
            migration(2, "checkins", "CREATE TABLE checkins (id INTEGER);"),
            migration(4, "weigh_ins", "CREATE TABLE weigh_ins (id INTEGER);"),
        ];
        let mut applied = BTreeMap::new();
        applied.insert(1, entry(1, "users", migrations[0].checksum()));
        applied.insert(2, entry(2, "checkins", checksum("edited since")));
        applied.insert(3, entry(3, "dropped", checksum("gone")));

        let states: Vec<_> = compute(&migrations, &applied)
            .into_iter()
            .map(|s| (s.version, s.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (1, MigrationState::Applied),
                (2, MigrationState::Modified),
                (3, MigrationState::Missing),
                (4, MigrationState::Pending),
            ]
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let status = MigrationStatus {
            version: 7,
            name: "add_finances_tracking".to_string(),
            state: MigrationState::Pending,
            applied_at: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "pending");
        assert!(json["applied_at"].is_null());
    }
}
