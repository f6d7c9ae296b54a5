use super::*;

#[test]
fn defaults_apply_when_nothing_is_configured() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache, CacheSettings::default());
    assert!(!settings.cache.synchronize);
    assert_eq!(settings.cache.persistent_dir, PathBuf::from("persistent-cache"));
    assert_eq!(settings.cache.capacity.get(), 10_000);
    assert_eq!(settings.cache.dummy_key_days.get(), 365);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.persistent_dir = Some(PathBuf::from("/srv/from-file"));
    raw.logging.level = Some("info".to_string());

    let overrides = CacheOverrides {
        persistent_dir: Some(PathBuf::from("/srv/from-cli")),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.persistent_dir, PathBuf::from("/srv/from-cli"));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = CacheOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn blank_key_context_is_dropped() {
    let mut raw = RawSettings::default();
    raw.cache.key_context = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.key_context, None);

    let mut raw = RawSettings::default();
    raw.cache.key_context = Some(" tenant-a ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.key_context.as_deref(), Some("tenant-a"));
}

#[test]
fn zero_capacity_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.capacity = Some(0);

    let err = Settings::from_raw(raw).expect_err("invalid capacity");
    assert!(matches!(err, LoadError::Invalid { key: "cache.capacity", .. }));
}

#[test]
fn oversized_dummy_key_days_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.dummy_key_days = Some(u64::from(u32::MAX) + 1);

    let err = Settings::from_raw(raw).expect_err("out of range");
    assert!(matches!(err, LoadError::Invalid { key: "cache.dummy_key_days", .. }));
}

#[test]
fn invalid_log_level_names_the_key() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn parse_sweep_command() {
    let args = CliArgs::parse_from(["farmcache", "sweep", "--persistent-dir", "/srv/cache"]);

    assert!(matches!(args.command, Command::Sweep));
    assert_eq!(
        args.overrides.persistent_dir,
        Some(PathBuf::from("/srv/cache"))
    );
}

#[test]
fn parse_inspect_arguments() {
    let args = CliArgs::parse_from([
        "farmcache",
        "--log-json",
        "true",
        "inspect",
        "news|detail|1",
        "--site",
        "corp",
    ]);

    assert_eq!(args.overrides.log_json, Some(true));
    match args.command {
        Command::Inspect(key) => {
            assert_eq!(key.key, "news|detail|1");
            assert_eq!(key.site.as_deref(), Some("corp"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_path_without_site() {
    let args = CliArgs::parse_from(["farmcache", "path", "news|1"]);

    match args.command {
        Command::Path(key) => {
            assert_eq!(key.key, "news|1");
            assert!(key.site.is_none());
        }
        other => panic!("unexpected command: {other:?}"),
    }
}
