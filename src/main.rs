use clap::Parser;
use k_sqlite_backup::backup::backup_config::BackupJobConfig;
use k_sqlite_backup::backup::result_error::error::Error;
use k_sqlite_backup::backup::result_error::WithMsg;
use rayon::ThreadPoolBuilder;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};
use validator::Validate;

/// Copy a live SQLite database into a backup file, a few pages at a time
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = File::open(&args.config)
        .map_err(Error::from)
        .and_then(|f| {
            serde_yml::from_reader::<_, BackupJobConfig>(f)
                .map_err(Error::from)
                .with_msg(format!("Parse YAML config failed: {:?}", &args.config))
        })
        .and_then(|bc| {
            bc.validate()
                .map_err(Error::from)
                .map(|_| bc)
                .with_msg(format!("Config validation failed: {:?}", &args.config))
        })
        .and_then(|bc| {
            let mut builder = ThreadPoolBuilder::new();
            if let Some(threads) = bc.worker_threads {
                builder = builder.num_threads(threads);
            }
            let pool = builder.build()?;
            bc.run(Arc::new(pool))
        });

    match res {
        Ok(report) if report.is_complete() => {
            info!("Backup complete");
            return;
        }
        Ok(report) => warn!("Backup ended {}: {:?}", report.status(), report.last_error()),
        Err(e) => error!("{e}"),
    }

    exit(1);
}
