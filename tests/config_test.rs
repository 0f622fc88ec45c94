//! Loading node configuration from disk

use std::io::Write;

use tempfile::NamedTempFile;

use dkg_node::Config;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[node]
peer_id = "node-a"
ask = "0.25"

[commands]
parallelism = 8
verbose_logging = true

[protocol]
send_finality_ack = false

[chain]
implementations = ["hardhat:31337", "otp:2043"]
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.node.peer_id, "node-a");
    assert_eq!(config.node.ask, "0.25");
    assert_eq!(config.commands.parallelism, 8);
    assert!(config.commands.verbose_logging);
    assert!(!config.protocol.send_finality_ack);
    assert_eq!(config.chain.implementations.len(), 2);
    // untouched sections keep their defaults
    assert_eq!(config.operations.minimum_number_of_node_replications, 3);
    assert_eq!(config.api.http_port, 8900);
}

#[test]
fn test_invalid_toml_is_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "[commands\nparallelism = ").unwrap();

    let err = Config::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("invalid config"));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(&dir.path().join("absent.toml")).is_err());
}
