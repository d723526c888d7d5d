use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

/// Routes served next to the configured MCP path.
const RESERVED_PATHS: [&str; 4] = ["/health", "/.well-known/mcp", "/sse", "/rpc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Http,
    Stdio,
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "stdio" => Ok(Self::Stdio),
            _ => Err(ConfigError::InvalidTransport),
        }
    }
}

/// How standard input is split into JSON documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioFraming {
    /// Non-blank lines accumulate until a blank line closes the frame.
    BlankLine,
    /// Every non-blank line is one complete document.
    Line,
}

impl FromStr for StdioFraming {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blank-line" | "blankline" => Ok(Self::BlankLine),
            "line" | "ndjson" => Ok(Self::Line),
            _ => Err(ConfigError::InvalidFraming),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportMode,
    pub bind_addr: String,
    pub bind_port: u16,
    pub mcp_path: String,
    pub sse_ping_interval: Duration,
    pub shutdown_timeout: Duration,
    pub stdio_framing: StdioFraming,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of: http, stdio")]
    InvalidTransport,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("MCP_PATH must start with '/', contain no whitespace and not shadow a built-in route")]
    InvalidPath,
    #[error("{0} must be a positive number of seconds")]
    InvalidSeconds(&'static str),
    #[error("MCP_STDIO_FRAMING must be one of: blank-line, line")]
    InvalidFraming,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportMode::Http,
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 8080,
            mcp_path: "/mcp".to_string(),
            sse_ping_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            stdio_framing: StdioFraming::BlankLine,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let transport = value("MCP_TRANSPORT")
            .map(|value| value.parse::<TransportMode>())
            .transpose()?
            .unwrap_or(defaults.transport);
        let bind_addr = value("BIND_ADDR").unwrap_or(defaults.bind_addr);
        let bind_port = value("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(defaults.bind_port);
        let mcp_path = value("MCP_PATH").unwrap_or(defaults.mcp_path);
        if !mcp_path.starts_with('/')
            || mcp_path.chars().any(char::is_whitespace)
            || RESERVED_PATHS.contains(&mcp_path.as_str())
        {
            return Err(ConfigError::InvalidPath);
        }
        let sse_ping_interval = seconds(value("MCP_SSE_PING_SECS"), "MCP_SSE_PING_SECS")?
            .unwrap_or(defaults.sse_ping_interval);
        let shutdown_timeout = seconds(
            value("MCP_SHUTDOWN_TIMEOUT_SECS"),
            "MCP_SHUTDOWN_TIMEOUT_SECS",
        )?
        .unwrap_or(defaults.shutdown_timeout);
        let stdio_framing = value("MCP_STDIO_FRAMING")
            .map(|value| value.parse::<StdioFraming>())
            .transpose()?
            .unwrap_or(defaults.stdio_framing);

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            mcp_path,
            sse_ping_interval,
            shutdown_timeout,
            stdio_framing,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn seconds(value: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| {
            value
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or(ConfigError::InvalidSeconds(key))
        })
        .transpose()
}
