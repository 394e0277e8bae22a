//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, str::FromStr};

use clap::{Parser, builder::BoolishValueParser};
use config::{Config, Environment, File};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::Generation;
use crate::http::Method;
use crate::interceptor::{DEFAULT_MAX_ENTRY_BYTES, EligibilityFilter};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "swrproxy";
const ENV_PREFIX: &str = "SWRPROXY";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_SCOPE: &str = "/";
const DEFAULT_MAX_ENTRIES: usize = 1024;
const DEFAULT_CACHE_DIRECTORY: &str = "cache";

/// Command-line arguments for the proxy binary.
#[derive(Debug, Default, Parser)]
#[command(
    name = "swrproxy",
    version,
    about = "Stale-while-revalidate caching reverse proxy"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SWRPROXY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the origin URL requests are forwarded to.
    #[arg(long = "origin", value_name = "URL")]
    pub origin: Option<String>,

    /// Override the current cache generation.
    #[arg(long = "generation", value_name = "NAME")]
    pub generation: Option<String>,

    /// Override the cache exclusion pattern (regular expression on the path).
    #[arg(long = "exclude", value_name = "REGEX")]
    pub exclude: Option<String>,

    /// Override the cache backend (memory|disk).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the disk cache directory.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub cache_directory: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub origin: Url,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub generation: Generation,
    pub filter: EligibilityFilter,
    pub key_headers: Vec<String>,
    pub backend: CacheBackend,
    pub max_entry_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Memory { max_entries: NonZeroUsize },
    Disk { directory: PathBuf },
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.methods")
            .with_list_parse_key("cache.key_headers")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli_overrides(cli);

    Settings::from_raw(raw)
}

/// Resolve configuration from the process arguments.
pub fn load_from_args() -> Result<Settings, LoadError> {
    load(&CliArgs::parse())
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_cli_overrides(&mut self, cli: &CliArgs) {
        if let Some(listen) = cli.listen.as_ref() {
            self.server.listen = Some(listen.clone());
        }
        if let Some(origin) = cli.origin.as_ref() {
            self.origin.url = Some(origin.clone());
        }
        if let Some(generation) = cli.generation.as_ref() {
            self.cache.generation = Some(generation.clone());
        }
        if let Some(exclude) = cli.exclude.as_ref() {
            self.cache.exclude = Some(exclude.clone());
        }
        if let Some(backend) = cli.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(directory) = cli.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            origin,
            cache,
            logging,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            origin: build_origin(origin)?,
            cache: build_cache_settings(cache)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let candidate = server.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen = candidate.trim().parse().map_err(|err| {
        LoadError::invalid(
            "server.listen",
            format!("invalid address `{candidate}`: {err}"),
        )
    })?;
    Ok(ServerSettings { listen })
}

fn build_origin(origin: RawOriginSettings) -> Result<Url, LoadError> {
    let raw = non_empty(origin.url).ok_or_else(|| LoadError::invalid("origin.url", "is required"))?;
    let url = Url::parse(&raw)
        .map_err(|err| LoadError::invalid("origin.url", format!("failed to parse: {err}")))?;
    if url.scheme() != "http" {
        return Err(LoadError::invalid(
            "origin.url",
            format!("scheme `{}` is not supported; use http", url.scheme()),
        ));
    }
    if url.host_str().is_none() {
        return Err(LoadError::invalid("origin.url", "must include a host"));
    }
    Ok(url)
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let name = non_empty(cache.generation)
        .ok_or_else(|| LoadError::invalid("cache.generation", "is required"))?;
    let generation =
        Generation::new(name).map_err(|err| LoadError::invalid("cache.generation", err.to_string()))?;

    let methods = match cache.methods {
        Some(names) => names
            .iter()
            .map(|name| name.trim().to_ascii_uppercase())
            .filter(|name| !name.is_empty())
            .filter_map(|name| Method::from_str(&name).ok())
            .collect(),
        None => vec![Method::Get],
    };
    let mut filter = EligibilityFilter::new()
        .with_methods(methods)
        .map_err(|err| LoadError::invalid("cache.methods", err.to_string()))?;

    if let Some(pattern) = non_empty(cache.exclude) {
        let regex = Regex::new(&pattern)
            .map_err(|err| LoadError::invalid("cache.exclude", err.to_string()))?;
        filter = filter.exclude(regex);
    }

    let scope = non_empty(cache.scope).unwrap_or_else(|| DEFAULT_SCOPE.to_string());
    if !scope.starts_with('/') {
        return Err(LoadError::invalid("cache.scope", "must start with `/`"));
    }
    filter = filter.with_scope(scope);

    let key_headers = cache
        .key_headers
        .unwrap_or_default()
        .into_iter()
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let backend = match non_empty(cache.backend).as_deref().unwrap_or("memory") {
        "memory" => {
            let max_entries = cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES as u64);
            let max_entries = usize::try_from(max_entries)
                .ok()
                .and_then(NonZeroUsize::new)
                .ok_or_else(|| LoadError::invalid("cache.max_entries", "must be greater than zero"))?;
            CacheBackend::Memory { max_entries }
        }
        "disk" => CacheBackend::Disk {
            directory: cache
                .directory
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIRECTORY)),
        },
        other => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}`; expected memory or disk"),
            ));
        }
    };

    let max_entry_bytes = match cache.max_entry_bytes {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.max_entry_bytes",
                "must be greater than zero",
            ));
        }
        Some(bytes) => usize::try_from(bytes).map_err(|_| {
            LoadError::invalid("cache.max_entry_bytes", "value exceeds supported range")
        })?,
        None => DEFAULT_MAX_ENTRY_BYTES,
    };

    Ok(CacheSettings {
        generation,
        filter,
        key_headers,
        backend,
        max_entry_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    generation: Option<String>,
    exclude: Option<String>,
    scope: Option<String>,
    methods: Option<Vec<String>>,
    key_headers: Option<Vec<String>>,
    backend: Option<String>,
    directory: Option<PathBuf>,
    max_entries: Option<u64>,
    max_entry_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests;
