use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::Migration;
use crate::error::{MigrationError, Result};

/// Recognized migration script extension.
pub const SCRIPT_EXTENSION: &str = "sql";

/// One entry of a migration source listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A flat listing of migration scripts.
pub trait MigrationSource {
    /// Where the scripts come from, for diagnostics.
    fn location(&self) -> PathBuf;

    fn entries(&self) -> io::Result<Vec<SourceEntry>>;

    fn read(&self, name: &str) -> io::Result<String>;
}

impl<M: MigrationSource + ?Sized> MigrationSource for Box<M> {
    fn location(&self) -> PathBuf {
        (**self).location()
    }

    fn entries(&self) -> io::Result<Vec<SourceEntry>> {
        (**self).entries()
    }

    fn read(&self, name: &str) -> io::Result<String> {
        (**self).read(name)
    }
}

/// Scripts stored as files in a directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MigrationSource for DirectorySource {
    fn location(&self) -> PathBuf {
        self.dir.clone()
    }

    fn entries(&self) -> io::Result<Vec<SourceEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("Skipping migration entry with non UTF-8 name: {:?}", raw);
                    continue;
                }
            };
            entries.push(SourceEntry {
                name,
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(entries)
    }

    fn read(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.dir.join(name))
    }
}

/// Scripts held in memory, e.g. compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    scripts: Vec<(String, String)>,
}

impl StaticSource {
    pub fn new<I, N, S>(scripts: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(name, script)| (name.into(), script.into()))
                .collect(),
        }
    }
}

impl MigrationSource for StaticSource {
    fn location(&self) -> PathBuf {
        PathBuf::from("<embedded>")
    }

    fn entries(&self) -> io::Result<Vec<SourceEntry>> {
        Ok(self
            .scripts
            .iter()
            .map(|(name, _)| SourceEntry {
                name: name.clone(),
                is_dir: false,
            })
            .collect())
    }

    fn read(&self, name: &str) -> io::Result<String> {
        self.scripts
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, script)| script.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

/// Split `<digits>_<name>.sql` into version and name.
///
/// `Ok(None)` means the entry is not a migration script at all and is
/// skipped. A leading token that is not a non-negative integer is fatal.
fn parse_filename(filename: &str) -> Result<Option<(u32, String)>> {
    let Some(stem) = filename
        .strip_suffix(SCRIPT_EXTENSION)
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return Ok(None);
    };

    let Some((token, name)) = stem.split_once('_') else {
        return Ok(None);
    };

    let invalid = || MigrationError::InvalidFilename {
        filename: filename.to_string(),
    };
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let version = token.parse::<u32>().map_err(|_| invalid())?;

    Ok(Some((version, name.to_string())))
}

/// Discover every migration in `source`, ascending by version.
pub fn scan(source: &dyn MigrationSource) -> Result<Vec<Migration>> {
    let location = source.location();
    let entries = source.entries().map_err(|e| MigrationError::Discovery {
        path: location.clone(),
        source: e,
    })?;

    let mut migrations = Vec::new();
    for entry in entries {
        if entry.is_dir {
            continue;
        }

        let Some((version, name)) = parse_filename(&entry.name)? else {
            if Path::new(&entry.name).extension() == Some(OsStr::new(SCRIPT_EXTENSION)) {
                warn!(
                    "Skipping {}: expected <version>_<name>.{}",
                    entry.name, SCRIPT_EXTENSION
                );
            }
            continue;
        };

        let script = source
            .read(&entry.name)
            .map_err(|e| MigrationError::ReadScript {
                path: location.join(&entry.name),
                source: e,
            })?;

        debug!("Discovered migration {:04}_{}", version, name);
        migrations.push(Migration {
            version,
            name,
            script,
            filename: entry.name,
        });
    }

    migrations.sort_by_key(|m| m.version);

    if let Some(pair) = migrations
        .windows(2)
        .find(|pair| pair[0].version == pair[1].version)
    {
        return Err(MigrationError::DuplicateVersion {
            version: pair[0].version,
            first: pair[0].filename.clone(),
            second: pair[1].filename.clone(),
        });
    }

    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_filename("0007_add_finances_tracking.sql").unwrap(),
            Some((7, "add_finances_tracking".to_string()))
        );
        assert_eq!(
            parse_filename("12_a_b.sql").unwrap(),
            Some((12, "a_b".to_string()))
        );
        assert_eq!(parse_filename("README.md").unwrap(), None);
        assert_eq!(parse_filename("0001.sql").unwrap(), None);
        assert_eq!(parse_filename("0001_init.sql.bak").unwrap(), None);
        assert_eq!(parse_filename("0001_initsql").unwrap(), None);
    }

    #[test]
    fn test_parse_filename_rejects_non_numeric_version() {
        for bad in ["v1_init.sql", "+1_init.sql", "-1_init.sql", "_init.sql", "99999999999_x.sql"] {
            let err = parse_filename(bad).unwrap_err();
            assert!(
                matches!(err, MigrationError::InvalidFilename { ref filename } if filename == bad),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn test_scan_sorts_by_version() {
        let source = StaticSource::new([
            ("0010_ten.sql", "SELECT 10;"),
            ("0002_two.sql", "SELECT 2;"),
            ("notes.txt", "ignored"),
            ("0001_one.sql", "SELECT 1;"),
        ]);
        let migrations = scan(&source).unwrap();
        let versions: Vec<_> = migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(migrations[2].name, "ten");
        assert_eq!(migrations[2].script, "SELECT 10;");
        assert_eq!(migrations[2].filename, "0010_ten.sql");
    }

    #[test]
    fn test_scan_rejects_duplicate_versions() {
        let source = StaticSource::new([("0003_a.sql", "SELECT 1;"), ("3_b.sql", "SELECT 2;")]);
        match scan(&source).unwrap_err() {
            MigrationError::DuplicateVersion { version, first, second } => {
                assert_eq!(version, 3);
                let mut files = [first, second];
                files.sort();
                assert_eq!(files, ["0003_a.sql".to_string(), "3_b.sql".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_scan_fails_fast_on_bad_filename() {
        let source = StaticSource::new([("0001_ok.sql", "SELECT 1;"), ("abc_bad.sql", "SELECT 2;")]);
        assert!(matches!(
            scan(&source),
            Err(MigrationError::InvalidFilename { .. })
        ));
    }

    #[test]
    fn test_scan_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0002_second.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("0001_first.sql"), "SELECT 1;\n").unwrap();
        fs::create_dir(dir.path().join("0003_not_a_file.sql")).unwrap();

        let migrations = scan(&DirectorySource::new(dir.path())).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].name, "first");
        assert_eq!(migrations[0].script, "SELECT 1;\n");
        assert_eq!(migrations[1].version, 2);
    }

    #[test]
    fn test_scan_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        match scan(&DirectorySource::new(&missing)).unwrap_err() {
            MigrationError::Discovery { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_scan_empty_source() {
        assert!(scan(&StaticSource::default()).unwrap().is_empty());
    }
}
