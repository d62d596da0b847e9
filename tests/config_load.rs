use std::io::Write;

use relaymq::config::{load_config, IoMode};
use relaymq::core::distributor::DistributionPolicy;
use relaymq::Config;

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("relaymq.toml").expect("failed to load config");

    assert_eq!(cfg.server.bind_addr, "127.0.0.1:7676");
    assert_eq!(cfg.server.max_connections, 1024);
    assert_eq!(cfg.server.server_id, "relaymq-1");
    assert!(cfg.server.persistence_enabled);
    assert_eq!(cfg.journal.file_size, 10 * 1024 * 1024);
    assert_eq!(cfg.journal.io_mode, IoMode::Sync);
    assert_eq!(cfg.journal.compact_percentage, 30);
    assert_eq!(cfg.delivery.producer_window_size, 65536);
    assert_eq!(cfg.delivery.distribution, DistributionPolicy::RoundRobin);

    let orders = &cfg.address_settings["orders.#"];
    assert_eq!(orders.dead_letter_address.as_deref(), Some("dlq.orders"));
    assert_eq!(orders.max_delivery_attempts, 5);
    assert_eq!(orders.max_size_bytes, Some(100 * 1024 * 1024));
    assert_eq!(cfg.address_settings["#"].expiry_address.as_deref(), Some("expiry"));
}

#[test]
fn invalid_values_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[journal]\nmin_files = 1").unwrap();
    assert!(load_config(file.path()).is_err());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[address_settings.\"a.#\"]\nmax_delivery_attempts = 0").unwrap();
    assert!(load_config(file.path()).is_err());
}

#[test]
fn async_mode_and_policy_parse() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[journal]\nio_mode = \"async\"\n[delivery]\ndistribution = \"grouping\""
    )
    .unwrap();
    let cfg = load_config(file.path()).unwrap();
    assert_eq!(cfg.journal.io_mode, IoMode::Async);
    assert_eq!(cfg.delivery.distribution, DistributionPolicy::Grouping);
    assert_eq!(cfg.journal.min_files, 2);
}
