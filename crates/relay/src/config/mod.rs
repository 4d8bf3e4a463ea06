use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;
use timeline::http::{Compression, HttpSettings};
use timeline::{Backend, TransportConfig, TransportKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TIMELINE_RELAY_BACKEND_HOST is required but not set")]
    BackendHostMissing,

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("TIMELINE_RELAY_TRANSPORT has invalid value: {0} (expected \"http\" or \"opentsdb\")")]
    InvalidTransport(String),

    #[error("TIMELINE_RELAY_COMPRESSION has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),

    #[error(transparent)]
    Transport(#[from] timeline::ConfigError),
}

#[derive(Debug)]
pub struct Config {
    pub transport: TransportKind,
    pub backend: Backend,
    pub listener_port: u16,
    pub transport_config: TransportConfig,
    pub http: HttpSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with("TIMELINE_RELAY_"))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let transport = parse_transport(vars)?;
        let host = vars
            .get("TIMELINE_RELAY_BACKEND_HOST")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::BackendHostMissing)?;
        let backend_port = parse_number(vars, "TIMELINE_RELAY_BACKEND_PORT", 4242)?;
        let listener_port = parse_number(vars, "TIMELINE_RELAY_LISTENER_PORT", 8787)?;

        let transport_config = TransportConfig {
            transport_buffer_size: parse_buffer_size(vars, "TIMELINE_RELAY_BUFFER_SIZE")?,
            batch_send_interval: parse_duration_ms(
                vars,
                "TIMELINE_RELAY_BATCH_SEND_INTERVAL_MS",
                1000,
            )?,
            request_timeout: parse_duration_ms(vars, "TIMELINE_RELAY_REQUEST_TIMEOUT_MS", 5000)?,
            serializer_buffer_size: parse_number(
                vars,
                "TIMELINE_RELAY_SERIALIZER_BUFFER_SIZE",
                2048,
            )?,
        };
        transport_config.validate()?;

        let http = HttpSettings {
            path: vars
                .get("TIMELINE_RELAY_HTTP_PATH")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| HttpSettings::default().path),
            compression: parse_compression(vars)?,
            headers: parse_headers(vars),
        };

        Ok(Self {
            transport,
            backend: Backend::new(host.clone(), backend_port),
            listener_port,
            transport_config,
            http,
        })
    }
}

fn parse_transport(vars: &HashMap<String, String>) -> Result<TransportKind, ConfigError> {
    match vars.get("TIMELINE_RELAY_TRANSPORT").map(|s| s.as_str()) {
        Some("http") | Some("") | None => Ok(TransportKind::Http),
        Some("opentsdb") => Ok(TransportKind::OpenTsdb),
        Some(other) => Err(ConfigError::InvalidTransport(other.to_owned())),
    }
}

fn parse_number<N: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: N,
) -> Result<N, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_number(vars, name, default_ms).map(Duration::from_millis)
}

/// `0` selects an unbounded queue.
fn parse_buffer_size(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<usize>, ConfigError> {
    match parse_number(vars, name, 1024usize)? {
        0 => Ok(None),
        size => Ok(Some(size)),
    }
}

fn parse_compression(vars: &HashMap<String, String>) -> Result<Compression, ConfigError> {
    match vars.get("TIMELINE_RELAY_COMPRESSION").map(|s| s.as_str()) {
        Some("none") | None => Ok(Compression::None),
        Some("gzip") => Ok(Compression::Gzip),
        Some(other) => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}

fn parse_headers(vars: &HashMap<String, String>) -> Vec<(String, String)> {
    vars.get("TIMELINE_RELAY_HTTP_HEADERS")
        .filter(|s| !s.is_empty())
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    let k = k.trim();
                    if k.is_empty() {
                        return None;
                    }
                    Some((k.to_owned(), v.trim().to_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}
