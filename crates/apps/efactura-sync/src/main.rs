//! efactura-sync - periodic e-Factura invoice synchronization
//!
//! Runs the sync driver over every company with auto-sync enabled.
//!
//! Usage: `efactura-sync [--once] [--data-dir <path>]`
//!
//! The vault key comes from `EFACTURA_MASTER_KEY` (base64, 32 bytes) or, as a
//! fallback, is derived from `EFACTURA_SECRET_KEY`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use efactura::{AesGcmVault, AnafSettings, EfacturaService, SecretVault};
use log::{error, info, warn};

struct Args {
    once: bool,
    data_dir: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        once: false,
        data_dir: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--once" => args.once = true,
            "--data-dir" => {
                let dir = iter.next().context("--data-dir needs a path")?;
                args.data_dir = Some(PathBuf::from(dir));
            }
            other => bail!("unknown argument {other:?}; usage: efactura-sync [--once] [--data-dir <path>]"),
        }
    }
    Ok(args)
}

fn load_vault() -> Result<Arc<dyn SecretVault>> {
    if let Some(key) = config::env_var("EFACTURA_MASTER_KEY") {
        let vault = AesGcmVault::new(&key).context("EFACTURA_MASTER_KEY is invalid")?;
        return Ok(Arc::new(vault));
    }
    if let Some(secret) = config::env_var("EFACTURA_SECRET_KEY") {
        warn!("Deriving the vault key from EFACTURA_SECRET_KEY; prefer EFACTURA_MASTER_KEY");
        return Ok(Arc::new(AesGcmVault::from_passphrase(&secret)));
    }
    bail!("set EFACTURA_MASTER_KEY (or EFACTURA_SECRET_KEY) to open stored credentials")
}

fn run() -> Result<()> {
    let args = parse_args()?;

    // Bootstrap config directory
    if let Err(e) = config::init() {
        warn!("Failed to initialize config directory: {}", e);
    }

    let settings = AnafSettings::load().context("Failed to load settings")?;
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => config::ensure_data_dir()?,
    };
    let vault = load_vault()?;

    let service = EfacturaService::open(&data_dir, vault, settings)?;
    let scheduler = service.scheduler();

    if args.once {
        let report = scheduler.run_cycle()?;
        info!(
            "Cycle done: {} due, {} completed, {} failed, {} skipped for invalid tax id",
            report.due, report.completed, report.failed, report.invalid_tax_id
        );
        return Ok(());
    }

    scheduler.run_until_shutdown();
    Ok(())
}

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
