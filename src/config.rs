use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_postgres::config::SslMode;

#[derive(Parser, Debug, Clone)]
#[command(name = "hard75-db")]
#[command(about = "Schema migrations for the 75 Hard accountability tracker", long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[arg(long, env = "MIGRATIONS_DIR", global = true, help = "Directory of <version>_<name>.sql files (defaults to the bundled set)")]
    pub migrations_dir: Option<PathBuf>,

    #[arg(long, default_value = "info", env = "LOG_LEVEL", global = true)]
    pub log_level: String,

    // SQLite
    #[arg(long, env = "SQLITE_PATH", global = true, help = "Migrate an SQLite database file instead of PostgreSQL")]
    pub sqlite: Option<PathBuf>,

    // PostgreSQL
    #[arg(long, env = "DB_HOST", global = true)]
    pub db_host: Option<String>,

    #[arg(long, default_value = "5432", env = "DB_PORT", global = true)]
    pub db_port: u16,

    #[arg(long, default_value = "postgres", env = "DB_USER", global = true)]
    pub db_user: String,

    #[arg(long, env = "DB_PASSWORD", global = true, hide_env_values = true)]
    pub db_password: Option<String>,

    #[arg(long, default_value = "hard75", env = "DB_NAME", global = true)]
    pub db_name: String,

    #[arg(long, default_value = "require", env = "DB_SSLMODE", global = true, help = "disable, prefer or require")]
    pub db_sslmode: String,

    #[arg(long, env = "DB_SSLROOTCERT", global = true, help = "PEM file of extra CA certificates to trust")]
    pub db_sslrootcert: Option<PathBuf>,

    #[arg(long, default_value = "60", env = "MIGRATION_LOCK_TIMEOUT_SECS", global = true, help = "Seconds to wait for another migrating process")]
    pub lock_timeout_secs: u64,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Apply every pending migration (default)
    Migrate,
    /// Show the state of every migration
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Verify applied migrations against their source without applying anything
    Validate,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DB_PASSWORD is required when DB_HOST is set")]
    MissingPassword,

    #[error("unsupported DB_SSLMODE '{0}' (expected disable, prefer or require)")]
    InvalidSslMode(String),
}

/// The store a run targets.
#[derive(Debug, Clone)]
pub enum DatabaseTarget {
    Sqlite(PathBuf),
    Postgres(tokio_postgres::Config),
    /// Nothing configured; the tracker runs without persistence.
    None,
}

impl Config {
    /// Resolve every value from CLI args and environment variables.
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Migrate)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// SQLite wins when a path is set, then PostgreSQL when a host is set.
    pub fn database(&self) -> Result<DatabaseTarget, ConfigError> {
        if let Some(path) = &self.sqlite {
            return Ok(DatabaseTarget::Sqlite(path.clone()));
        }

        let Some(host) = self.db_host.as_deref().filter(|h| !h.is_empty()) else {
            return Ok(DatabaseTarget::None);
        };

        let password = self
            .db_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingPassword)?;

        let ssl_mode = match self.db_sslmode.to_ascii_lowercase().as_str() {
            "disable" => SslMode::Disable,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            other => return Err(ConfigError::InvalidSslMode(other.to_string())),
        };

        let mut pg = tokio_postgres::Config::new();
        pg.host(host)
            .port(self.db_port)
            .user(&self.db_user)
            .password(password)
            .dbname(&self.db_name)
            .ssl_mode(ssl_mode)
            .application_name("hard75-db");
        Ok(DatabaseTarget::Postgres(pg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["hard75-db"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config {
            db_host: None,
            sqlite: None,
            ..parse(&[])
        };
        assert_eq!(config.command(), Command::Migrate);
        assert_eq!(config.db_port, 5432);
        assert_eq!(config.db_user, "postgres");
        assert_eq!(config.db_name, "hard75");
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert!(matches!(config.database(), Ok(DatabaseTarget::None)));
    }

    #[test]
    fn test_tls_required_by_default() {
        let config = Config {
            sqlite: None,
            db_sslmode: "require".to_string(),
            ..parse(&["--db-host", "db.internal", "--db-password", "secret"])
        };
        assert_eq!(parse(&[]).db_sslmode, "require");
        match config.database().unwrap() {
            DatabaseTarget::Postgres(pg) => assert_eq!(pg.get_ssl_mode(), SslMode::Require),
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn test_status_subcommand() {
        let config = parse(&["status", "--json"]);
        assert_eq!(config.command(), Command::Status { json: true });
    }

    #[test]
    fn test_sqlite_wins() {
        let config = parse(&["--sqlite", "tracker.db", "--db-host", "db.internal"]);
        match config.database().unwrap() {
            DatabaseTarget::Sqlite(path) => assert_eq!(path, PathBuf::from("tracker.db")),
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn test_postgres_requires_password() {
        let config = Config {
            sqlite: None,
            db_password: None,
            ..parse(&["--db-host", "db.internal"])
        };
        assert_eq!(config.database().unwrap_err(), ConfigError::MissingPassword);
    }

    #[test]
    fn test_postgres_target() {
        let config = parse(&[
            "--db-host",
            "db.internal",
            "--db-password",
            "secret",
            "--db-port",
            "6543",
            "--db-sslmode",
            "DISABLE",
        ]);
        let config = Config { sqlite: None, ..config };
        match config.database().unwrap() {
            DatabaseTarget::Postgres(pg) => {
                assert_eq!(pg.get_ports(), &[6543]);
                assert_eq!(pg.get_dbname(), Some("hard75"));
                assert_eq!(pg.get_ssl_mode(), SslMode::Disable);
            }
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_sslmode() {
        let config = parse(&["--db-host", "h", "--db-password", "p", "--db-sslmode", "verify-full"]);
        let config = Config { sqlite: None, ..config };
        assert_eq!(
            config.database().unwrap_err(),
            ConfigError::InvalidSslMode("verify-full".to_string())
        );
    }
}
