//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, from a TOML file at
//! `~/.config/chat-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (see [`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [upstream]
//! base_url = "https://example.openai.azure.com"
//! path = "/openai/deployments/gpt-4/chat/completions?api-version=2023-03-15-preview"
//! api_key_env = "AZURE_OPENAI_KEY"
//! auth = "api_key"
//!
//! [relay]
//! pacing = "fixed"          # fixed | backpressure | none
//! pacing_ms = 15
//! channel_capacity = 256
//! frame_timeout_secs = 120  # 0 waits forever
//!
//! [server]
//! listen_addr = "127.0.0.1:8080"
//! delivery_interval_ms = 10
//! idle_eviction_secs = 1800 # 0 disables eviction
//!
//! [prompt]
//! system = "You are a helpful assistant."
//! temperature = 0.1
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{AuthScheme, BackendConfig};
use crate::prompt::{ExampleTurn, PromptTemplate, SamplingParams};
use crate::relay::{
    EndOfStreamPolicy, PacingPolicy, RelayConfig, DEFAULT_BACKPRESSURE_WAIT,
    DEFAULT_FRAME_IDLE_TIMEOUT, DEFAULT_PACING_DELAY,
};
use crate::sink::DEFAULT_CHANNEL_CAPACITY;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[upstream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamToml {
    /// Scheme and host of the completion API
    pub base_url: Option<String>,
    /// Request path (deployment and api-version included)
    pub path: Option<String>,
    /// Literal API key (prefer `api_key_env`)
    pub api_key: Option<String>,
    /// Name of an environment variable holding the API key
    pub api_key_env: Option<String>,
    /// `api_key` (Azure header) or `bearer`
    pub auth: Option<String>,
    /// Model name sent in the body
    pub model: Option<String>,
    /// Whole-call timeout in seconds (0 = none)
    pub request_timeout_secs: Option<u64>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

/// `[relay]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// `fixed`, `backpressure` or `none`
    pub pacing: Option<String>,
    /// Fixed delay per fragment in milliseconds
    pub pacing_ms: Option<u64>,
    /// Backpressure wait limit in milliseconds
    pub backpressure_wait_ms: Option<u64>,
    /// Per-subscriber buffer size
    pub channel_capacity: Option<usize>,
    /// Fragment emitted once at end of stream (unset = suppress)
    pub end_marker: Option<String>,
    /// Upstream frame idle timeout in seconds (0 = none)
    pub frame_timeout_secs: Option<u64>,
    /// Cancel calls nobody listens to after this many seconds (0 = never)
    pub zero_subscriber_grace_secs: Option<u64>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Socket address to bind
    pub listen_addr: Option<String>,
    /// Delay between two delivered fragments in milliseconds
    pub delivery_interval_ms: Option<u64>,
    /// SSE keep-alive comment interval in seconds
    pub keep_alive_secs: Option<u64>,
    /// Evict channels with no subscriber after this many seconds (0 = never)
    pub idle_eviction_secs: Option<u64>,
    /// How often the idle sweeper runs, in seconds
    pub sweep_interval_secs: Option<u64>,
    /// Substitute whitespace before sending fragments
    pub escape_whitespace: Option<bool>,
    /// Replacement for a space
    pub space_token: Option<String>,
    /// Replacement for a newline
    pub newline_token: Option<String>,
}

/// `[prompt]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptToml {
    /// System turn
    pub system: Option<String>,
    /// Few-shot examples
    pub examples: Option<Vec<ExampleTurn>>,
    /// Response length limit
    pub max_tokens: Option<u32>,
    /// Randomness
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff
    pub top_p: Option<f32>,
    /// Repetition penalty
    pub frequency_penalty: Option<f32>,
    /// Presence penalty
    pub presence_penalty: Option<f32>,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigToml {
    /// Completion API connection
    pub upstream: UpstreamToml,
    /// Relay behaviour
    pub relay: RelayToml,
    /// HTTP server
    pub server: ServerToml,
    /// Request shaping
    pub prompt: PromptToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Pacing mode name as written in config and env
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacingMode {
    /// Sleep a fixed delay per fragment
    #[default]
    Fixed,
    /// Wait for channel capacity
    Backpressure,
    /// No throttling
    Unpaced,
}

impl FromStr for PacingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_delay" | "delay" => Ok(Self::Fixed),
            "backpressure" => Ok(Self::Backpressure),
            "none" | "off" | "unpaced" => Ok(Self::Unpaced),
            other => Err(ConfigError::ValidationError(format!(
                "unknown pacing mode '{other}' (expected fixed, backpressure or none)"
            ))),
        }
    }
}

/// Relay behaviour after resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelaySettings {
    /// Pacing mode
    pub pacing: PacingMode,
    /// Delay used by fixed pacing
    pub pacing_delay: Duration,
    /// Wait limit used by backpressure pacing
    pub backpressure_wait: Duration,
    /// Per-subscriber buffer size
    pub channel_capacity: usize,
    /// End-of-stream marker (`None` suppresses)
    pub end_marker: Option<String>,
    /// Upstream frame idle timeout
    pub frame_idle_timeout: Option<Duration>,
    /// Zero-subscriber grace
    pub zero_subscriber_grace: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pacing: PacingMode::Fixed,
            pacing_delay: DEFAULT_PACING_DELAY,
            backpressure_wait: DEFAULT_BACKPRESSURE_WAIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            end_marker: None,
            frame_idle_timeout: Some(DEFAULT_FRAME_IDLE_TIMEOUT),
            zero_subscriber_grace: None,
        }
    }
}

impl RelaySettings {
    /// Pacing policy for the relay
    #[must_use]
    pub fn pacing_policy(&self) -> PacingPolicy {
        match self.pacing {
            PacingMode::Fixed => PacingPolicy::FixedDelay {
                delay: self.pacing_delay,
            },
            PacingMode::Backpressure => PacingPolicy::Backpressure {
                max_wait: self.backpressure_wait,
            },
            PacingMode::Unpaced => PacingPolicy::Unpaced,
        }
    }
}

/// Display substitution at the SSE boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplaySettings {
    /// Whether substitution is applied
    pub escape_whitespace: bool,
    /// Replacement for a space
    pub space_token: String,
    /// Replacement for a newline
    pub newline_token: String,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            escape_whitespace: false,
            space_token: "&nbsp;".to_string(),
            newline_token: "<br>".to_string(),
        }
    }
}

/// HTTP server settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    /// Socket address to bind
    pub listen_addr: SocketAddr,
    /// Delay between two delivered fragments
    pub delivery_interval: Duration,
    /// SSE keep-alive interval
    pub keep_alive: Duration,
    /// Evict channels idle this long (`None` never evicts)
    pub idle_eviction: Option<Duration>,
    /// Sweeper period
    pub sweep_interval: Duration,
    /// Display substitution
    pub display: DisplaySettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            delivery_interval: Duration::from_millis(10),
            keep_alive: Duration::from_secs(15),
            idle_eviction: Some(Duration::from_secs(30 * 60)),
            sweep_interval: Duration::from_secs(60),
            display: DisplaySettings::default(),
        }
    }
}

/// Resolved relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfigFile {
    /// Completion API connection
    pub upstream: BackendConfig,
    /// Relay behaviour
    pub relay: RelaySettings,
    /// HTTP server
    pub server: ServerSettings,
    /// Fixed conversation prefix
    pub prompt: PromptTemplate,
    /// Sampling knobs
    pub sampling: SamplingParams,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfigFile {
    fn default() -> Self {
        Self {
            upstream: BackendConfig::default(),
            relay: RelaySettings::default(),
            server: ServerSettings::default(),
            prompt: PromptTemplate::default(),
            sampling: SamplingParams::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Relay configuration derived from these settings
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            pacing: self.relay.pacing_policy(),
            end_of_stream: match &self.relay.end_marker {
                Some(marker) => EndOfStreamPolicy::Forward {
                    marker: marker.clone(),
                },
                None => EndOfStreamPolicy::Suppress,
            },
            frame_idle_timeout: self.relay.frame_idle_timeout,
            zero_subscriber_grace: self.relay.zero_subscriber_grace,
            sampling: self.sampling.clone(),
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.upstream.base_url.as_str();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "upstream.base_url must start with http:// or https://, got '{base}'"
            )));
        }
        if self.relay.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "relay.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.server.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "server.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.sampling.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "prompt.temperature must be within 0..=2, got {}",
                self.sampling.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.sampling.top_p) {
            return Err(ConfigError::ValidationError(format!(
                "prompt.top_p must be within 0..=1, got {}",
                self.sampling.top_p
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-relay/relay.toml` or
/// `~/.config/chat-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if a
/// resolved value is invalid. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the process environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if a resolved
/// value is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfigFile, ConfigError> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

/// Load configuration, resolving environment variables through `lookup`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env(
    path: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfigFile, ConfigError> {
    let mut config = RelayConfigFile::default();
    let mut toml_config = ConfigToml::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            toml_config = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, &toml_config, lookup);
    config.validate()?;
    Ok(config)
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfigFile, toml: &ConfigToml) -> Result<(), ConfigError> {
    // Upstream settings
    let upstream = &toml.upstream;
    if let Some(url) = &upstream.base_url {
        config.upstream.base_url.clone_from(url);
    }
    if let Some(path) = &upstream.path {
        config.upstream.path.clone_from(path);
    }
    if upstream.api_key.is_some() {
        config.upstream.api_key.clone_from(&upstream.api_key);
    }
    if let Some(auth) = &upstream.auth {
        config.upstream.auth = AuthScheme::parse(auth).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "unknown upstream.auth '{auth}' (expected api_key or bearer)"
            ))
        })?;
    }
    if upstream.model.is_some() {
        config.upstream.model.clone_from(&upstream.model);
    }
    if let Some(secs) = upstream.request_timeout_secs {
        config.upstream.request_timeout = secs_or_none(secs);
    }
    if let Some(secs) = upstream.connect_timeout_secs {
        config.upstream.connect_timeout = Duration::from_secs(secs);
    }

    // Relay settings
    let relay = &toml.relay;
    if let Some(mode) = &relay.pacing {
        config.relay.pacing = mode.parse()?;
    }
    if let Some(ms) = relay.pacing_ms {
        config.relay.pacing_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = relay.backpressure_wait_ms {
        config.relay.backpressure_wait = Duration::from_millis(ms);
    }
    if let Some(capacity) = relay.channel_capacity {
        config.relay.channel_capacity = capacity;
    }
    if let Some(marker) = &relay.end_marker {
        config.relay.end_marker = Some(marker.clone());
    }
    if let Some(secs) = relay.frame_timeout_secs {
        config.relay.frame_idle_timeout = secs_or_none(secs);
    }
    if let Some(secs) = relay.zero_subscriber_grace_secs {
        config.relay.zero_subscriber_grace = secs_or_none(secs);
    }

    // Server settings
    let server = &toml.server;
    if let Some(addr) = &server.listen_addr {
        config.server.listen_addr = addr.parse().map_err(|_| {
            ConfigError::ValidationError(format!("invalid server.listen_addr '{addr}'"))
        })?;
    }
    if let Some(ms) = server.delivery_interval_ms {
        config.server.delivery_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = server.keep_alive_secs {
        config.server.keep_alive = Duration::from_secs(secs);
    }
    if let Some(secs) = server.idle_eviction_secs {
        config.server.idle_eviction = secs_or_none(secs);
    }
    if let Some(secs) = server.sweep_interval_secs {
        config.server.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(enabled) = server.escape_whitespace {
        config.server.display.escape_whitespace = enabled;
    }
    if let Some(token) = &server.space_token {
        config.server.display.space_token.clone_from(token);
    }
    if let Some(token) = &server.newline_token {
        config.server.display.newline_token.clone_from(token);
    }

    // Prompt settings
    let prompt = &toml.prompt;
    if prompt.system.is_some() {
        config.prompt.system.clone_from(&prompt.system);
    }
    if let Some(examples) = &prompt.examples {
        config.prompt.examples.clone_from(examples);
    }
    if let Some(max_tokens) = prompt.max_tokens {
        config.sampling.max_tokens = max_tokens;
    }
    if let Some(temperature) = prompt.temperature {
        config.sampling.temperature = temperature;
    }
    if let Some(top_p) = prompt.top_p {
        config.sampling.top_p = top_p;
    }
    if let Some(penalty) = prompt.frequency_penalty {
        config.sampling.frequency_penalty = penalty;
    }
    if let Some(penalty) = prompt.presence_penalty {
        config.sampling.presence_penalty = penalty;
    }
    if prompt.stop.is_some() {
        config.sampling.stop.clone_from(&prompt.stop);
    }

    Ok(())
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(var = name, value = value, "Ignoring unparseable environment value");
    }
    parsed
}

/// Apply environment variable overrides to the config
fn apply_env_config(
    config: &mut RelayConfigFile,
    toml: &ConfigToml,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let mut from_env = false;

    // Upstream settings from environment
    if let Some(url) = lookup("RELAY_UPSTREAM_URL") {
        config.upstream.base_url = url;
        from_env = true;
    }
    if let Some(path) = lookup("RELAY_UPSTREAM_PATH") {
        config.upstream.path = path;
        from_env = true;
    }
    if let Some(model) = lookup("RELAY_MODEL") {
        config.upstream.model = Some(model);
        from_env = true;
    }
    if let Some(auth) = lookup("RELAY_AUTH_MODE") {
        match AuthScheme::parse(&auth) {
            Some(scheme) => {
                config.upstream.auth = scheme;
                from_env = true;
            }
            None => tracing::warn!(value = %auth, "Ignoring unknown RELAY_AUTH_MODE"),
        }
    }

    // API key: explicit override, then the file's named variable, then the
    // conventional OpenAI variable as a last resort
    if let Some(key) = lookup("RELAY_API_KEY") {
        config.upstream.api_key = Some(key);
        from_env = true;
    } else if config.upstream.api_key.is_none() {
        let named = toml.upstream.api_key_env.as_deref().and_then(&lookup);
        let key = named.or_else(|| lookup("OPENAI_API_KEY"));
        if key.is_some() {
            config.upstream.api_key = key;
            from_env = true;
        }
    }

    // Relay settings from environment
    if let Some(mode) = lookup("RELAY_PACING") {
        match mode.parse() {
            Ok(mode) => {
                config.relay.pacing = mode;
                from_env = true;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring RELAY_PACING"),
        }
    }
    if let Some(ms) = lookup("RELAY_PACING_MS").and_then(|v| parse_env::<u64>("RELAY_PACING_MS", &v))
    {
        config.relay.pacing_delay = Duration::from_millis(ms);
        from_env = true;
    }
    if let Some(capacity) = lookup("RELAY_CHANNEL_CAPACITY")
        .and_then(|v| parse_env::<usize>("RELAY_CHANNEL_CAPACITY", &v))
    {
        config.relay.channel_capacity = capacity;
        from_env = true;
    }
    if let Some(marker) = lookup("RELAY_END_MARKER") {
        config.relay.end_marker = (!marker.is_empty()).then_some(marker);
        from_env = true;
    }
    if let Some(secs) = lookup("RELAY_FRAME_TIMEOUT_SECS")
        .and_then(|v| parse_env::<u64>("RELAY_FRAME_TIMEOUT_SECS", &v))
    {
        config.relay.frame_idle_timeout = secs_or_none(secs);
        from_env = true;
    }

    // Server settings from environment
    if let Some(addr) = lookup("RELAY_LISTEN_ADDR")
        .and_then(|v| parse_env::<SocketAddr>("RELAY_LISTEN_ADDR", &v))
    {
        config.server.listen_addr = addr;
        from_env = true;
    }
    if let Some(ms) = lookup("RELAY_DELIVERY_INTERVAL_MS")
        .and_then(|v| parse_env::<u64>("RELAY_DELIVERY_INTERVAL_MS", &v))
    {
        config.server.delivery_interval = Duration::from_millis(ms);
        from_env = true;
    }
    if let Some(secs) = lookup("RELAY_IDLE_EVICTION_SECS")
        .and_then(|v| parse_env::<u64>("RELAY_IDLE_EVICTION_SECS", &v))
    {
        config.server.idle_eviction = secs_or_none(secs);
        from_env = true;
    }

    // Prompt settings from environment
    if let Some(system) = lookup("RELAY_SYSTEM_PROMPT") {
        config.prompt.system = Some(system);
        from_env = true;
    }

    if from_env {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Values supplied on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub listen_addr: Option<SocketAddr>,
    /// Upstream base URL override
    pub upstream_url: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set upstream URL override
    #[must_use]
    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = Some(url.into());
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfigFile) {
        if self.listen_addr.is_some() || self.upstream_url.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(addr) = self.listen_addr {
            config.server.listen_addr = addr;
        }
        if let Some(url) = &self.upstream_url {
            config.upstream.base_url.clone_from(url);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
