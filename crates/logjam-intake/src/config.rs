// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::TokenSet;
use crate::decoder::{BodyDecoder, Schema, Strictness};
use crate::dispatcher::{DispatcherSettings, OverflowPolicy};
use crate::record::RepeatedParam;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 1323;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_ACCEPTED_CONTENT_TYPES: &str = "application/json,text/plain";
const DEFAULT_LOG_LEVEL: &str = "info";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Tokens accepted in the `x-logjam-token` header
    pub tokens: TokenSet,
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, in bytes
    pub max_body_bytes: usize,
    /// Base media types accepted on JSON routes, lowercase
    pub accepted_content_types: Vec<String>,
    pub schema: Schema,
    pub single_strictness: Strictness,
    pub multi_strictness: Strictness,
    pub repeated_param: RepeatedParam,
    pub dispatcher: DispatcherSettings,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tokens: TokenSet::default(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            accepted_content_types: parse_list(DEFAULT_ACCEPTED_CONTENT_TYPES),
            schema: Schema::open(),
            single_strictness: Strictness::Strict,
            multi_strictness: Strictness::Strict,
            repeated_param: RepeatedParam::FirstWins,
            dispatcher: DispatcherSettings::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let tokens = TokenSet::from_config_str(&env::var("LOGJAM_TOKENS").unwrap_or_default());
        let host = env::var("LOGJAM_HOST")
            .ok()
            .filter(|host| !host.trim().is_empty())
            .unwrap_or(defaults.host);
        let accepted_content_types = env::var("LOGJAM_ACCEPTED_CONTENT_TYPES")
            .map(|types| parse_list(&types))
            .unwrap_or(defaults.accepted_content_types);
        let schema = match env::var("LOGJAM_SCHEMA") {
            Ok(schema) => Schema::from_config_str(&schema)
                .map_err(|e| invalid_var("LOGJAM_SCHEMA", &schema, e))?,
            Err(_) => defaults.schema,
        };
        let sink_timeout = match env::var("LOGJAM_SINK_TIMEOUT_MS") {
            Ok(ms) if !ms.trim().is_empty() => Some(Duration::from_millis(
                ms.trim()
                    .parse::<u64>()
                    .map_err(|e| invalid_var("LOGJAM_SINK_TIMEOUT_MS", &ms, e))?,
            )),
            _ => None,
        };

        let dispatcher = DispatcherSettings {
            workers: parse_env("LOGJAM_DISPATCH_WORKERS", defaults.dispatcher.workers)?,
            queue_size: parse_env("LOGJAM_DISPATCH_QUEUE_SIZE", defaults.dispatcher.queue_size)?,
            overflow: parse_env::<OverflowPolicy>(
                "LOGJAM_DISPATCH_OVERFLOW",
                defaults.dispatcher.overflow,
            )?,
            sink_timeout,
            drain_timeout: Duration::from_millis(parse_env(
                "LOGJAM_SHUTDOWN_DRAIN_TIMEOUT_MS",
                5000u64,
            )?),
        };

        let config = Self {
            tokens,
            host,
            port: parse_env("LOGJAM_PORT", defaults.port)?,
            max_body_bytes: parse_env("LOGJAM_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            accepted_content_types,
            schema,
            single_strictness: Strictness::from_strict_flag(parse_env(
                "LOGJAM_SINGLE_STRICT",
                true,
            )?),
            multi_strictness: Strictness::from_strict_flag(parse_env(
                "LOGJAM_MULTI_STRICT",
                true,
            )?),
            repeated_param: parse_env("LOGJAM_REPEATED_PARAM", defaults.repeated_param)?,
            dispatcher,
            log_level: env::var("LOGJAM_LOG_LEVEL")
                .map(|level| level.trim().to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        if config.tokens.is_empty() {
            warn!("LOGJAM_TOKENS is empty, every authenticated request will be rejected");
        } else {
            debug!("Loaded {} auth tokens", config.tokens.len());
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "LOGJAM_MAX_BODY_BYTES must be greater than 0".to_string(),
            ));
        }

        if self.dispatcher.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "LOGJAM_DISPATCH_WORKERS must be greater than 0".to_string(),
            ));
        }

        if self.dispatcher.queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "LOGJAM_DISPATCH_QUEUE_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.accepted_content_types.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "LOGJAM_ACCEPTED_CONTENT_TYPES cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid LOGJAM_LOG_LEVEL '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn body_decoder(&self) -> BodyDecoder {
        BodyDecoder::new(
            self.max_body_bytes,
            &self.accepted_content_types,
            self.schema.clone(),
        )
    }
}

/// Reads `name` and parses it, falling back to `default` when unset or blank.
fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map_err(|e| invalid_var(name, &value, e)),
        _ => Ok(default),
    }
}

fn invalid_var(name: &str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::InvalidConfig(format!("{name}='{value}': {reason}"))
}

fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
