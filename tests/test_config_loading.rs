//! Configuration loading and validation tests
//!
//! Exercises loading from disk, secret resolution from the environment, and
//! the errors a misconfigured device reports at startup.

use coopwatch::config::{ConfigError, CoopConfig, LinkCredentials, LinkType};
use coopwatch::QoS;
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_full_wireless_config_loads() {
    std::env::set_var("COOPWATCH_IT_WIFI_PASS", "henhouse-secret");
    std::env::set_var("COOPWATCH_IT_BROKER_TOKEN", "aio_token");

    let file = write_config(
        r#"
[device]
client_id = "coop-north"
poll_interval_ms = 250

[link]
type = "wireless"
ssid = "farm-ap"
password_env = "COOPWATCH_IT_WIFI_PASS"
dhcp_attempts = 2

[link.fallback]
address = "192.168.1.50"
subnet = "255.255.255.0"
gateway = "192.168.1.1"

[broker]
host = "io.adafruit.com"
tls = true
username = "farmer"
auth_token_env = "COOPWATCH_IT_BROKER_TOKEN"
keep_alive_secs = 30

[backoff]
initial_ms = 500
max_ms = 20000

[telemetry]
topic_prefix = "{username}/feeds/"
sample_interval_secs = 120
buffer_capacity = 32
qos = 0
retain = true

[health]
enabled = true
port = 9090
"#,
    );

    let config = assert_ok!(CoopConfig::load_from_file(file.path()));
    assert_eq!(config.device.client_id, "coop-north");
    assert_eq!(config.device.poll_interval_ms, 250);
    assert_eq!(config.link.link_type, LinkType::Wireless);
    assert_eq!(config.backoff.multiplier, 2.0);
    assert_eq!(config.telemetry.qos, QoS::AtMostOnce);
    assert!(config.health.enabled);
    assert_eq!(config.topic_prefix(), "farmer/feeds");

    let connection = assert_ok!(config.connection_config());
    assert_eq!(connection.broker_port, 8883);
    assert_eq!(connection.auth_token.as_deref(), Some("aio_token"));
    assert_eq!(connection.keep_alive, Duration::from_secs(30));
    assert_eq!(connection.handshake_timeout, Duration::from_secs(10));
    assert_eq!(connection.dhcp_attempts, 2);
    assert_eq!(
        connection.fallback_static_address.map(|s| s.address),
        Some(Ipv4Addr::new(192, 168, 1, 50))
    );
    assert_eq!(
        connection.credentials,
        LinkCredentials::Wireless {
            ssid: "farm-ap".to_string(),
            passphrase: "henhouse-secret".to_string(),
        }
    );

    // Secrets stay out of debug output
    let debug = format!("{connection:?}");
    assert!(!debug.contains("henhouse-secret"));
    assert!(!debug.contains("aio_token"));
}

#[test]
fn test_minimal_wired_config_uses_defaults() {
    let file = write_config(
        r#"
[device]
client_id = "coop-south"

[link]
type = "wired"
mac = "90-a2-da-0d-51-c8"

[broker]
host = "192.168.1.12"
"#,
    );

    let config = assert_ok!(CoopConfig::load_from_file(file.path()));
    assert_eq!(config.device.poll_interval_ms, 100);
    assert_eq!(config.telemetry.buffer_capacity, 64);
    assert_eq!(config.telemetry.sample_interval_secs, 60);
    assert_eq!(config.topic_prefix(), "coop/coop-south");
    assert!(!config.health.enabled);

    let connection = assert_ok!(config.connection_config());
    assert_eq!(connection.broker_port, 1883);
    assert!(connection.auth_token.is_none());
    assert!(connection.fallback_static_address.is_none());
    match connection.credentials {
        LinkCredentials::Wired { mac } => assert_eq!(mac.to_string(), "90:A2:DA:0D:51:C8"),
        other => panic!("expected wired credentials, got {other:?}"),
    }
}

#[test]
fn test_missing_file_is_read_error() {
    let result = CoopConfig::load_from_file(std::path::Path::new("/nonexistent/coopwatch.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[device\nclient_id = ");
    let result = CoopConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unknown_link_type_is_parse_error() {
    let file = write_config(
        r#"
[device]
client_id = "coop"

[link]
type = "cellular"

[broker]
host = "localhost"
"#,
    );
    let result = CoopConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_rejected_at_load() {
    let cases = [
        (
            "bad client id",
            r#"
[device]
client_id = "coop north"
[link]
type = "wired"
mac = "90:A2:DA:0D:51:C8"
[broker]
host = "localhost"
"#,
        ),
        (
            "wired without mac",
            r#"
[device]
client_id = "coop"
[link]
type = "wired"
[broker]
host = "localhost"
"#,
        ),
        (
            "zero buffer",
            r#"
[device]
client_id = "coop"
[link]
type = "wired"
mac = "90:A2:DA:0D:51:C8"
[broker]
host = "localhost"
[telemetry]
buffer_capacity = 0
"#,
        ),
        (
            "inverted backoff",
            r#"
[device]
client_id = "coop"
[link]
type = "wired"
mac = "90:A2:DA:0D:51:C8"
[broker]
host = "localhost"
[backoff]
initial_ms = 60000
max_ms = 1000
"#,
        ),
    ];

    for (name, content) in cases {
        let file = write_config(content);
        let result = CoopConfig::load_from_file(file.path());
        assert!(
            matches!(
                result,
                Err(ConfigError::InvalidClientId(_)) | Err(ConfigError::InvalidConfig(_))
            ),
            "{name}: expected validation error, got {result:?}"
        );
    }
}

#[test]
fn test_unset_secret_variable_fails_resolution() {
    std::env::remove_var("COOPWATCH_IT_UNSET_TOKEN");
    let file = write_config(
        r#"
[device]
client_id = "coop"

[link]
type = "wired"
mac = "90:A2:DA:0D:51:C8"

[broker]
host = "localhost"
auth_token_env = "COOPWATCH_IT_UNSET_TOKEN"
"#,
    );

    // The file itself is valid; resolution is what fails
    let config = assert_ok!(CoopConfig::load_from_file(file.path()));
    let error = assert_err!(config.connection_config());
    match error {
        ConfigError::EnvVarNotFound(name) => assert_eq!(name, "COOPWATCH_IT_UNSET_TOKEN"),
        other => panic!("expected EnvVarNotFound, got {other:?}"),
    }
}

#[test]
fn test_config_round_trips_through_toml() {
    let file = write_config(
        r#"
[device]
client_id = "coop"

[link]
type = "wired"
mac = "90:A2:DA:0D:51:C8"

[broker]
host = "localhost"
port = 1884
"#,
    );

    let config = assert_ok!(CoopConfig::load_from_file(file.path()));
    let rendered = assert_ok!(toml::to_string_pretty(&config));
    let reparsed: CoopConfig = assert_ok!(toml::from_str(&rendered));
    assert_eq!(reparsed, config);
}
