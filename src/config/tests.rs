use super::*;

use crate::http::Request;

fn minimal() -> RawSettings {
    let mut raw = RawSettings::default();
    raw.origin.url = Some("http://127.0.0.1:3000/".to_string());
    raw.cache.generation = Some("static-v1".to_string());
    raw
}

#[test]
fn defaults_fill_everything_but_origin_and_generation() {
    let settings = Settings::from_raw(minimal()).expect("valid settings");

    assert_eq!(settings.server.listen.to_string(), DEFAULT_LISTEN);
    assert_eq!(settings.origin.as_str(), "http://127.0.0.1:3000/");
    assert_eq!(settings.cache.generation.as_str(), "static-v1");
    assert_eq!(settings.cache.filter.methods(), &[Method::Get]);
    assert!(settings.cache.key_headers.is_empty());
    assert_eq!(settings.cache.max_entry_bytes, DEFAULT_MAX_ENTRY_BYTES);
    assert_eq!(
        settings.cache.backend,
        CacheBackend::Memory {
            max_entries: NonZeroUsize::new(DEFAULT_MAX_ENTRIES).unwrap()
        }
    );
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert_eq!(settings.logging.format, LogFormat::Compact);
}

#[test]
fn origin_and_generation_are_required() {
    let mut raw = minimal();
    raw.origin.url = None;
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "origin.url", .. })
    ));

    let mut raw = minimal();
    raw.cache.generation = Some("  ".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.generation", .. })
    ));
}

#[test]
fn https_origin_is_rejected() {
    let mut raw = minimal();
    raw.origin.url = Some("https://example.com/".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "origin.url", .. })
    ));
}

#[test]
fn generation_must_be_a_safe_name() {
    let mut raw = minimal();
    raw.cache.generation = Some("../escape".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.generation", .. })
    ));
}

#[test]
fn only_get_and_head_are_cacheable() {
    let mut raw = minimal();
    raw.cache.methods = Some(vec!["get".to_string(), "POST".to_string()]);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.methods", .. })
    ));

    let mut raw = minimal();
    raw.cache.methods = Some(vec!["GET".to_string(), "OPTIONS".to_string()]);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.methods", .. })
    ));

    let mut raw = minimal();
    raw.cache.methods = Some(vec!["GET".to_string(), "head".to_string()]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.filter.methods(), &[Method::Get, Method::Head]);
}

#[test]
fn exclusion_pattern_feeds_the_filter() {
    let mut raw = minimal();
    raw.cache.exclude = Some("^/browser-sync/".to_string());
    raw.cache.scope = Some("/static/".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");

    let filter = &settings.cache.filter;
    assert!(filter.is_eligible(&Request::new(Method::Get, "/static/app.js")));
    assert!(!filter.is_eligible(&Request::new(Method::Get, "/browser-sync/client.js")));
    assert!(!filter.is_eligible(&Request::new(Method::Get, "/api")));
}

#[test]
fn bad_exclusion_pattern_is_reported() {
    let mut raw = minimal();
    raw.cache.exclude = Some("(unclosed".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.exclude", .. })
    ));
}

#[test]
fn disk_backend_uses_directory() {
    let mut raw = minimal();
    raw.cache.backend = Some("disk".to_string());
    raw.cache.directory = Some(PathBuf::from("/var/cache/swrproxy"));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.cache.backend,
        CacheBackend::Disk {
            directory: PathBuf::from("/var/cache/swrproxy")
        }
    );

    let mut raw = minimal();
    raw.cache.backend = Some("redis".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.backend", .. })
    ));
}

#[test]
fn zero_limits_are_rejected() {
    let mut raw = minimal();
    raw.cache.max_entries = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.max_entries", .. })
    ));

    let mut raw = minimal();
    raw.cache.max_entry_bytes = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.max_entry_bytes", .. })
    ));
}

#[test]
fn key_headers_are_normalised() {
    let mut raw = minimal();
    raw.cache.key_headers = Some(vec![" Accept-Language ".to_string(), String::new()]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.key_headers, vec!["accept-language".to_string()]);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = minimal();
    raw.server.listen = Some("127.0.0.1:9000".to_string());
    raw.logging.level = Some("info".to_string());

    let cli = CliArgs::parse_from([
        "swrproxy",
        "--listen",
        "0.0.0.0:8181",
        "--generation",
        "static-v2",
        "--log-level",
        "debug",
        "--log-json",
        "yes",
    ]);
    raw.apply_cli_overrides(&cli);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.listen.port(), 8181);
    assert_eq!(settings.cache.generation.as_str(), "static-v2");
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
fn load_reads_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("proxy.toml");
    std::fs::write(
        &path,
        r#"
[server]
listen = "127.0.0.1:8282"

[origin]
url = "http://127.0.0.1:3000/"

[cache]
generation = "static-cache-v-d040c9ff"
exclude = "browser-sync"
key_headers = ["Accept-Encoding"]
max_entry_bytes = 1024
"#,
    )
    .expect("write config");

    let cli = CliArgs {
        config_file: Some(path),
        ..Default::default()
    };
    let settings = load(&cli).expect("settings load");

    assert_eq!(settings.server.listen.port(), 8282);
    assert_eq!(settings.cache.generation.as_str(), "static-cache-v-d040c9ff");
    assert_eq!(settings.cache.key_headers, vec!["accept-encoding".to_string()]);
    assert_eq!(settings.cache.max_entry_bytes, 1024);
}

#[test]
fn missing_config_file_is_an_error() {
    let cli = CliArgs {
        config_file: Some(PathBuf::from("/nonexistent/swrproxy.toml")),
        ..Default::default()
    };
    assert!(matches!(load(&cli), Err(LoadError::Build(_))));
}
