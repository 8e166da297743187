//! Connection URL handling: secret substitution and endpoint parsing.

use super::tls::SslMode;
use crate::error::{Result, SyncError};
use regex::{Captures, Regex};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::config::Host;
use tokio_postgres::Config as PgConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Replace each `$(command)` with the command's trimmed output.
///
/// Commands run once, through `sh -c`. A non-zero exit fails the run.
pub fn resolve_url(url: &str) -> Result<String> {
    let pattern = Regex::new(r"\$\(([^)]+)\)")
        .map_err(|e| SyncError::Config(format!("Invalid substitution pattern: {}", e)))?;

    let mut failure = None;
    let resolved = pattern.replace_all(url, |caps: &Captures| {
        if failure.is_some() {
            return String::new();
        }
        let command = &caps[1];
        match run_command(command) {
            Ok(output) => output,
            Err(e) => {
                failure = Some(e);
                String::new()
            }
        }
    });

    match failure {
        Some(e) => Err(e),
        None => Ok(resolved.into_owned()),
    }
}

fn run_command(command: &str) -> Result<String> {
    let output = Command::new("sh").arg("-c").arg(command).output()?;
    if !output.status.success() {
        return Err(SyncError::Config(format!(
            "Command exited with non-zero status:\n{}",
            command
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

/// A parsed database endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    config: PgConfig,
    ssl_mode: SslMode,
    local: bool,
}

impl Endpoint {
    /// Parse a `postgres://` URL, a `key=value` string, or a bare database name.
    pub fn parse(url: &str) -> Result<Self> {
        let (stripped, ssl_mode) = take_sslmode(url)?;

        let mut config = if is_url(&stripped) || stripped.contains('=') {
            PgConfig::from_str(&stripped).map_err(|e| {
                SyncError::Config(format!(
                    "Invalid connection string. Make sure it works with `psql`: {}",
                    e
                ))
            })?
        } else {
            let mut config = PgConfig::new();
            config.dbname(&stripped);
            config
        };

        let local = config.get_hosts().iter().all(|host| match host {
            Host::Tcp(name) => matches!(name.as_str(), "localhost" | "127.0.0.1" | "::1"),
            #[cfg(unix)]
            Host::Unix(_) => true,
        });

        apply_defaults(&mut config);
        config.ssl_mode(ssl_mode.driver_mode());

        Ok(Self {
            config,
            ssl_mode,
            local,
        })
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    /// Whether the host is localhost, a loopback address or a socket.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// `dbname on host:port`, without credentials.
    pub fn describe(&self) -> String {
        let dbname = self
            .config
            .get_dbname()
            .or_else(|| self.config.get_user())
            .unwrap_or("postgres");
        let host = match self.config.get_hosts().first() {
            Some(Host::Tcp(name)) => name.clone(),
            #[cfg(unix)]
            Some(Host::Unix(path)) => path.display().to_string(),
            None => return dbname.to_string(),
        };
        match self.config.get_ports().first() {
            Some(port) => format!("{} on {}:{}", dbname, host, port),
            None => format!("{} on {}", dbname, host),
        }
    }
}

fn is_url(value: &str) -> bool {
    value.starts_with("postgres://") || value.starts_with("postgresql://")
}

/// Remove `sslmode` from the string; the driver does not know the verify modes.
fn take_sslmode(url: &str) -> Result<(String, SslMode)> {
    if is_url(url) {
        let Some((base, query)) = url.split_once('?') else {
            return Ok((url.to_string(), SslMode::default()));
        };
        let mut mode = SslMode::default();
        let mut kept = Vec::new();
        for pair in query.split('&') {
            match pair.strip_prefix("sslmode=") {
                Some(value) => mode = SslMode::parse(value)?,
                None => kept.push(pair),
            }
        }
        let stripped = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        };
        Ok((stripped, mode))
    } else if url.contains('=') {
        let mut mode = SslMode::default();
        let mut kept = Vec::new();
        for pair in url.split_whitespace() {
            match pair.strip_prefix("sslmode=") {
                Some(value) => mode = SslMode::parse(value)?,
                None => kept.push(pair),
            }
        }
        Ok((kept.join(" "), mode))
    } else {
        Ok((url.to_string(), SslMode::default()))
    }
}

/// Fill what libpq would take from the environment.
fn apply_defaults(config: &mut PgConfig) {
    if config.get_hosts().is_empty() {
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        config.host(&host);
    }
    if config.get_ports().is_empty() {
        if let Some(port) = std::env::var("PGPORT").ok().and_then(|p| p.parse().ok()) {
            config.port(port);
        }
    }
    if config.get_user().is_none() {
        if let Ok(user) = std::env::var("PGUSER").or_else(|_| std::env::var("USER")) {
            config.user(&user);
        }
    }
    if config.get_password().is_none() {
        if let Ok(password) = std::env::var("PGPASSWORD") {
            config.password(password);
        }
    }
    if config.get_connect_timeout().is_none() {
        config.connect_timeout(CONNECT_TIMEOUT);
    }
    config.application_name("pgsync");
}
