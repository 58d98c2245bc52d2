//! Configuration management for the gateway binary

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::auth::{MAX_HASH_LEN, MIN_HASH_LEN};
use crate::gateway::{DEFAULT_READ_BUFFER, DEFAULT_WRITE_BUFFER};
use crate::range::{DEFAULT_CACHE_MAX_AGE, DEFAULT_CHUNK_SIZE, DEFAULT_PRELOAD_SIZE};
use crate::ChunkPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Deserialize)]
pub struct StreamConfig {
    pub secret: String,
    pub hash_length: usize,
    pub chunk_size: u64,
    pub preload_size: u64,
    pub read_buffer: usize,
    pub write_buffer: usize,
    /// Seconds.
    pub cache_max_age: u64,
    pub compression: bool,
}

#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub pool_size: usize,
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("secret", &"<redacted>")
            .field("hash_length", &self.hash_length)
            .field("chunk_size", &self.chunk_size)
            .field("preload_size", &self.preload_size)
            .field("read_buffer", &self.read_buffer)
            .field("write_buffer", &self.write_buffer)
            .field("cache_max_age", &self.cache_max_age)
            .field("compression", &self.compression)
            .finish()
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("tokens", &self.tokens.len())
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            stream: StreamConfig {
                secret: String::new(),
                hash_length: 16,
                chunk_size: DEFAULT_CHUNK_SIZE,
                preload_size: DEFAULT_PRELOAD_SIZE,
                read_buffer: DEFAULT_READ_BUFFER,
                write_buffer: DEFAULT_WRITE_BUFFER,
                cache_max_age: DEFAULT_CACHE_MAX_AGE.as_secs(),
                compression: false,
            },
            upstream: UpstreamConfig {
                url: String::new(),
                tokens: Vec::new(),
                pool_size: 4,
            },
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to
    /// pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_vars(|key| env::var(key).ok())
    }

    /// Builds a config from any variable source, applying defaults and
    /// validating the result.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |key: &str| var(key).filter(|value| !value.trim().is_empty());

        let config = Config {
            server: ServerConfig {
                host: var("GATEWAY_HOST").unwrap_or(defaults.server.host),
                port: parse(&var, "GATEWAY_PORT", defaults.server.port)?,
            },
            stream: StreamConfig {
                secret: var("GATEWAY_SECRET").ok_or(ConfigError::Missing("GATEWAY_SECRET"))?,
                hash_length: parse(&var, "GATEWAY_HASH_LENGTH", defaults.stream.hash_length)?,
                chunk_size: parse(&var, "GATEWAY_CHUNK_SIZE", defaults.stream.chunk_size)?,
                preload_size: parse(&var, "GATEWAY_PRELOAD_SIZE", defaults.stream.preload_size)?,
                read_buffer: parse(&var, "GATEWAY_READ_BUFFER", defaults.stream.read_buffer)?,
                write_buffer: parse(&var, "GATEWAY_WRITE_BUFFER", defaults.stream.write_buffer)?,
                cache_max_age: parse(&var, "GATEWAY_CACHE_MAX_AGE", defaults.stream.cache_max_age)?,
                compression: parse_bool(&var, "GATEWAY_COMPRESSION", defaults.stream.compression)?,
            },
            upstream: UpstreamConfig {
                url: var("UPSTREAM_URL").ok_or(ConfigError::Missing("UPSTREAM_URL"))?,
                tokens: var("UPSTREAM_TOKENS")
                    .map(|tokens| {
                        tokens
                            .split(',')
                            .map(str::trim)
                            .filter(|token| !token.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                pool_size: parse(&var, "GATEWAY_POOL_SIZE", defaults.upstream.pool_size)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, value: &dyn ToString| ConfigError::Invalid {
            key,
            value: value.to_string(),
        };

        let stream = &self.stream;
        if stream.hash_length % 2 != 0 || !(MIN_HASH_LEN..=MAX_HASH_LEN).contains(&stream.hash_length) {
            return Err(invalid("GATEWAY_HASH_LENGTH", &stream.hash_length));
        }
        if stream.chunk_size == 0 {
            return Err(invalid("GATEWAY_CHUNK_SIZE", &stream.chunk_size));
        }
        if stream.preload_size < stream.chunk_size {
            return Err(invalid("GATEWAY_PRELOAD_SIZE", &stream.preload_size));
        }
        if stream.read_buffer == 0 {
            return Err(invalid("GATEWAY_READ_BUFFER", &stream.read_buffer));
        }
        if stream.write_buffer == 0 {
            return Err(invalid("GATEWAY_WRITE_BUFFER", &stream.write_buffer));
        }
        let url = &self.upstream.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid("UPSTREAM_URL", url));
        }
        if self.upstream.tokens.is_empty() && self.upstream.pool_size == 0 {
            return Err(invalid("GATEWAY_POOL_SIZE", &self.upstream.pool_size));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            chunk_size: self.stream.chunk_size,
            preload_size: self.stream.preload_size,
            cache_max_age: Duration::from_secs(self.stream.cache_max_age),
        }
    }
}

fn parse<T, F>(var: F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_bool<F>(var: F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(value) => Err(ConfigError::Invalid { key, value: value.to_string() }),
    }
}
