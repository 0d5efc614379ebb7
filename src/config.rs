//! Session and proxy configuration.

use crate::error::{Result, TerminalError};
use crate::protocol::Backend;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_BACKEND: &str = "AGENT_PTY_BACKEND";
pub const ENV_SOCKET: &str = "AGENT_PTY_SOCKET";
pub const ENV_TOKEN: &str = "AGENT_PTY_TOKEN";
pub const ENV_TIMEOUT_MS: &str = "AGENT_PTY_TIMEOUT_MS";
pub const ENV_HELPER: &str = "AGENT_PTY_HELPER";

/// Connection settings for a remote terminal daemon
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Unix socket path of the daemon
    pub socket_path: PathBuf,
    /// Auth token sent in `hello`
    pub token: Option<String>,
    /// Handshake and spawn response timeout
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/agent-pty/daemon.sock"),
            token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for a session controller
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    /// Let `AGENT_PTY_BACKEND` override `backend` when a session starts
    pub backend_env_override: bool,
    pub cols: u16,
    pub rows: u16,
    /// Upper bound on buffered output, in bytes
    pub max_buffer_size: usize,
    /// Size of `recent_output` in observations, in bytes
    pub observation_window_size: usize,
    /// Output newer than this counts as streaming
    pub streaming_timeout: Duration,
    /// Typed after Ctrl+C on a graceful stop
    pub exit_command: String,
    /// How long a graceful stop waits for the child to exit
    pub stop_timeout: Duration,
    /// Extra environment merged over the current process environment
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Native PTY helper that must stay executable, if the platform has one
    pub pty_helper: Option<PathBuf>,
    pub proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            backend_env_override: true,
            cols: 120,
            rows: 40,
            max_buffer_size: 100_000,
            observation_window_size: 2_000,
            streaming_timeout: Duration::from_secs(2),
            exit_command: "/exit".to_string(),
            stop_timeout: Duration::from_secs(3),
            env: BTreeMap::new(),
            cwd: None,
            pty_helper: None,
            proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (process env in production)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(backend) = get(ENV_BACKEND) {
            self.backend = backend.parse()?;
        }
        if let Some(socket) = get(ENV_SOCKET) {
            self.proxy.socket_path = PathBuf::from(socket);
        }
        if let Some(token) = get(ENV_TOKEN) {
            self.proxy.token = Some(token);
        }
        if let Some(timeout) = get(ENV_TIMEOUT_MS) {
            let ms: u64 = timeout.parse().map_err(|_| {
                TerminalError::Config(format!(
                    "{} must be milliseconds, got '{}'",
                    ENV_TIMEOUT_MS, timeout
                ))
            })?;
            self.proxy.timeout = Duration::from_millis(ms);
        }
        if let Some(helper) = get(ENV_HELPER) {
            self.pty_helper = Some(PathBuf::from(helper));
        }
        Ok(())
    }

    /// Backend for the next session; the environment wins over the config
    /// unless `backend_env_override` is off
    pub fn resolve_backend(&self) -> Result<Backend> {
        if !self.backend_env_override {
            return Ok(self.backend);
        }
        match std::env::var(ENV_BACKEND) {
            Ok(value) if !value.trim().is_empty() => value.parse(),
            _ => Ok(self.backend),
        }
    }

    /// Environment for the child: current process env, then `TERM`, then `env`
    pub fn merged_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.entry("TERM".to_string())
            .or_insert_with(|| "xterm-256color".to_string());
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backend, Backend::Local);
        assert_eq!(config.stop_timeout, Duration::from_secs(3));
        assert_eq!(config.exit_command, "/exit");
    }

    #[test]
    fn test_apply_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BACKEND, "proxy"),
            (ENV_SOCKET, "/run/term.sock"),
            (ENV_TOKEN, "secret"),
            (ENV_TIMEOUT_MS, "250"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend, Backend::Proxy);
        assert_eq!(config.proxy.socket_path, PathBuf::from("/run/term.sock"));
        assert_eq!(config.proxy.token.as_deref(), Some("secret"));
        assert_eq!(config.proxy.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_apply_env_rejects_bad_values() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == ENV_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, TerminalError::Config(_)));

        let err = config
            .apply_env(|key| (key == ENV_BACKEND).then(|| "tmux".to_string()))
            .unwrap_err();
        assert!(matches!(err, TerminalError::Config(_)));
    }

    #[test]
    fn test_pinned_backend_ignores_env() {
        let config = Config {
            backend: Backend::Proxy,
            backend_env_override: false,
            ..Config::default()
        };
        assert_eq!(config.resolve_backend().unwrap(), Backend::Proxy);
    }

    #[test]
    fn test_merged_env_applies_overrides() {
        let mut config = Config::default();
        config
            .env
            .insert("AGENT_PTY_TEST_VAR".to_string(), "1".to_string());
        let env = config.merged_env();
        assert_eq!(env.get("AGENT_PTY_TEST_VAR").map(String::as_str), Some("1"));
        assert!(env.contains_key("TERM"));
    }
}
