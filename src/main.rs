use std::process;

use farmcache::{
    cache::{CacheConfig, PersistentStore},
    config::{self, Command, KeyArgs},
    infra::{error::InfraError, telemetry},
};
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let config = CacheConfig::from(&settings.cache);
    let store = PersistentStore::new(config.persistent_dir.clone());

    match cli_args.command {
        Command::Sweep => run_sweep(&store),
        Command::Inspect(args) => run_inspect(&store, &args),
        Command::Path(args) => {
            println!("{}", store.path_for(&args.key, args.site.as_deref()).display());
            Ok(())
        }
    }
}

fn run_sweep(store: &PersistentStore) -> Result<(), InfraError> {
    let report = store.sweep_expired(OffsetDateTime::now_utc());
    info!(
        root = %store.root().display(),
        scanned = report.scanned,
        expired = report.expired,
        corrupt = report.corrupt,
        "sweep finished"
    );
    println!(
        "scanned {} file(s), removed {} expired and {} corrupt",
        report.scanned, report.expired, report.corrupt
    );
    Ok(())
}

fn run_inspect(store: &PersistentStore, args: &KeyArgs) -> Result<(), InfraError> {
    let path = store.path_for(&args.key, args.site.as_deref());
    println!("path: {}", path.display());

    let Some(header) = store.inspect(&args.key, args.site.as_deref())? else {
        println!("status: missing");
        return Ok(());
    };

    let now = OffsetDateTime::now_utc();
    let status = if header.file_expires <= now {
        "file expired"
    } else if header.expires.is_some_and(|expires| expires <= now) {
        "stale"
    } else {
        "live"
    };

    println!("status: {status}");
    println!("key: {}", header.cache_key);
    println!("site: {}", header.site_name.as_deref().unwrap_or("-"));
    println!("cache minutes: {}", header.cache_minutes);
    match header.expires {
        Some(expires) => println!("expires: {expires}"),
        None => println!("expires: on restore + cache minutes"),
    }
    println!("file expires: {}", header.file_expires);
    if !header.dependencies.cache_keys().is_empty() {
        println!("depends on: {}", header.dependencies.cache_keys().join(", "));
    }
    Ok(())
}
