use super::load_config;
use super::settings::Settings;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.default_prefetch, 0);
    assert_eq!(settings.broker.anonymous_queue_prefix, "amq.gen-");
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    let cfg = temp_env::with_vars_unset(
        ["POPMQ__BROKER__DEFAULT_PREFETCH", "POPMQ__LOG__LEVEL"],
        || load_config().expect("load_config failed"),
    );
    env::set_current_dir(orig).expect("restore cwd");

    assert_eq!(cfg.broker.default_prefetch, 0);
    assert_eq!(cfg.log.level, "info");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        default_prefetch = 1
        anonymous_queue_prefix = "tmp."

        [log]
        level = "debug"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.broker.default_prefetch, 1);
    assert_eq!(cfg.broker.anonymous_queue_prefix, "tmp.");
    assert_eq!(cfg.log.level, "debug");
}

#[test]
#[serial]
fn env_overrides_single_key() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    let cfg = temp_env::with_var("POPMQ__BROKER__DEFAULT_PREFETCH", Some("5"), load_config);
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.broker.default_prefetch, 5);
    assert_eq!(cfg.broker.anonymous_queue_prefix, "amq.gen-");
}
