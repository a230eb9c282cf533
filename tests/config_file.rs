use std::io::Write;
use std::time::Duration;

use blendstore::SyncMode;
use blendstore::config::{self, CliArgs, LoadError};
use clap::Parser;
use serial_test::serial;
use tempfile::NamedTempFile;
use tracing::level_filters::LevelFilter;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("blendstore-")
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file.flush().expect("flush config");
    file
}

fn cli(file: &NamedTempFile, rest: &[&str]) -> CliArgs {
    let path = file.path().to_str().expect("utf-8 temp path");
    let mut args = vec!["blendstore", "--config-file", path];
    args.extend_from_slice(rest);
    CliArgs::parse_from(args)
}

const FULL: &str = r#"
[logging]
level = "warn"
json = true

[database]
url = "postgres://localhost/app"
max_connections = 4

[writes]
retry_attempts = 5
retry_backoff_ms = 20

[[entities]]
name = "User"
table = "users"
index = ["email"]
multi_index = ["group_id"]
cache_fields = ["email", "group_id", "age"]
sync = "sync"

[entities.fields]
id = "integer"
group_id = "integer"
age = "int"

[[entities]]
name = "Tag"
"#;

#[test]
#[serial]
fn file_settings_are_loaded() {
    let file = config_file(FULL);
    let settings = config::load(&cli(&file, &["check"])).expect("settings");

    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(
        settings.database.url.as_deref(),
        Some("postgres://localhost/app")
    );
    assert_eq!(settings.database.max_connections.get(), 4);
    assert_eq!(settings.writes.retry_attempts.get(), 5);
    assert_eq!(settings.writes.retry_backoff, Duration::from_millis(20));
    assert_eq!(settings.entities.len(), 2);

    let user = settings
        .entity("User")
        .expect("declared")
        .descriptor()
        .expect("descriptor");
    assert_eq!(user.table(), "users");
    assert_eq!(user.unique_key(), "id");
    assert_eq!(user.sync_mode(), SyncMode::Sync);
    assert!(user.is_index_field("email"));
    assert!(user.is_multi_index_field("group_id"));
    assert!(user.is_cached("id"));
    assert!(!user.is_cached("name"));

    let tag = settings
        .entity("Tag")
        .expect("declared")
        .descriptor()
        .expect("descriptor");
    assert_eq!(tag.table(), "Tag");
    assert_eq!(tag.sync_mode(), SyncMode::Async);
}

#[test]
#[serial]
fn command_line_overrides_the_file() {
    let file = config_file(FULL);
    let settings = config::load(&cli(
        &file,
        &[
            "--log-level",
            "debug",
            "get",
            "--database-url",
            "postgres://override/app",
            "--entity",
            "User",
            "--key",
            "1",
        ],
    ))
    .expect("settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(
        settings.database.url.as_deref(),
        Some("postgres://override/app")
    );
}

#[test]
#[serial]
fn invalid_file_values_name_the_offending_key() {
    let file = config_file(
        r#"
[[entities]]
name = "User"
sync = "later"
"#,
    );
    let err = config::load(&cli(&file, &["check"])).expect_err("bad sync mode");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "entities.sync",
            ..
        }
    ));
}

#[test]
#[serial]
fn missing_config_file_is_an_error() {
    let args = CliArgs::parse_from([
        "blendstore",
        "--config-file",
        "/nonexistent/blendstore.toml",
        "check",
    ]);
    let err = config::load(&args).expect_err("missing file");
    assert!(matches!(err, LoadError::Build(_)));
}
