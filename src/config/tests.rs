use std::env;
use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::load_config;
use super::settings::Settings;
use crate::broker::ExchangeKind;
use crate::client::LossDecision;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.max_consumers_per_queue, 0);
    assert_eq!(settings.broker.generated_queue_prefix, "gen.");
    assert_eq!(settings.broker.session_loss, LossDecision::Requeue);
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.exchanges.len(), 2);
    assert_eq!(settings.exchanges[0].name, "order_events");
    assert_eq!(settings.exchanges[0].kind, ExchangeKind::Topic);
    assert_eq!(settings.exchanges[1].kind, ExchangeKind::Fanout);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // load_config reads config/default.toml relative to the working directory
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        max_consumers_per_queue = 3
        session_loss = "drop"

        [logging]
        level = "debug"

        [[exchanges]]
        name = "audit"
        kind = "direct"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.broker.max_consumers_per_queue, 3);
    assert_eq!(cfg.broker.session_loss, LossDecision::Drop);
    assert_eq!(cfg.broker.generated_queue_prefix, "gen.");
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.exchanges.len(), 1);
    assert_eq!(cfg.exchanges[0].name, "audit");
    assert_eq!(cfg.exchanges[0].kind, ExchangeKind::Direct);
    assert!(cfg.exchanges[0].durable);
}

#[test]
#[serial]
fn load_config_reads_prefixed_environment() {
    temp_env::with_vars(
        [
            ("POPROUTE__BROKER__MAX_CONSUMERS_PER_QUEUE", Some("7")),
            ("POPROUTE__BROKER__GENERATED_QUEUE_PREFIX", Some("tmp.")),
            ("POPROUTE__LOGGING__LEVEL", Some("warn")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.broker.max_consumers_per_queue, 7);
            assert_eq!(cfg.broker.generated_queue_prefix, "tmp.");
            assert_eq!(cfg.logging.level, "warn");
            assert_eq!(cfg.exchanges.len(), 2);
        },
    );
}
