use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use hard75_db::config::{Command, Config, DatabaseTarget};
use hard75_db::migration::{DirectorySource, MigrationRunner, MigrationSource, MigrationStatus, bundled};
use hard75_db::store::tls;
use hard75_db::{MigrationError, PostgresStore, SqliteStore, Store};

fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .init();

    info!("hard75-db v{}", env!("CARGO_PKG_VERSION"));

    let mut store: Box<dyn Store> = match config.database()? {
        DatabaseTarget::Sqlite(path) => {
            info!("Using SQLite database: {}", path.display());
            Box::new(
                SqliteStore::open(&path)
                    .with_context(|| format!("Failed to open database {}", path.display()))?,
            )
        }
        DatabaseTarget::Postgres(pg) => {
            info!(
                "Using PostgreSQL database {} on {:?}",
                pg.get_dbname().unwrap_or_default(),
                pg.get_hosts()
            );
            let connector = tls::make_connector(config.db_sslrootcert.as_deref())
                .context("Failed to set up TLS")?;
            Box::new(PostgresStore::connect(&pg, connector).context("Failed to connect to database")?)
        }
        DatabaseTarget::None => {
            info!("No database configured, skipping migrations");
            return Ok(());
        }
    };
    store.ping().context("Failed to ping database")?;

    let source: Box<dyn MigrationSource> = match &config.migrations_dir {
        Some(dir) => Box::new(DirectorySource::new(dir)),
        None => {
            info!("No migrations directory configured, using the bundled migrations");
            Box::new(bundled())
        }
    };

    if let Err(e) = run_command(&config, store.as_mut(), source) {
        match e.downcast_ref::<MigrationError>() {
            Some(migration_error) => error!(
                "Migration failed during {} stage: {}",
                migration_error.stage(),
                migration_error
            ),
            None => error!("{:#}", e),
        }
        process::exit(1);
    }

    Ok(())
}

fn run_command(config: &Config, store: &mut dyn Store, source: Box<dyn MigrationSource>) -> Result<()> {
    let mut runner = MigrationRunner::new(store, source).with_lock_timeout(config.lock_timeout());

    match config.command() {
        Command::Migrate => {
            let cancel = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(cancel.clone())?;
            let report = runner.with_cancellation(cancel).run()?;
            info!("Migration run finished: {}", report);
        }
        Command::Status { json } => {
            let statuses = runner.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print_status_table(&statuses);
            }
        }
        Command::Validate => {
            let verified = runner.validate()?;
            info!("All {} applied migration(s) match their source", verified);
        }
    }

    Ok(())
}

/// First Ctrl-C stops the run between migrations, the second exits at once.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;

    std::thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if cancel.swap(true, Ordering::SeqCst) {
                        process::exit(130);
                    }
                    warn!("Interrupt received, stopping after the current migration (Ctrl-C again to abort)");
                }
            });
        })
        .context("Failed to spawn signal thread")?;

    Ok(())
}

fn print_status_table(statuses: &[MigrationStatus]) {
    if statuses.is_empty() {
        println!("No migrations found.");
        return;
    }

    println!("{:>7}  {:<40}  {:<8}  APPLIED AT", "VERSION", "NAME", "STATE");
    for status in statuses {
        let applied_at = status
            .applied_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>7}  {:<40}  {:<8}  {}",
            status.version,
            status.name,
            status.state.to_string(),
            applied_at
        );
    }
}
