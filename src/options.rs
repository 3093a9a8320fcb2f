//! Connection options shared by the synchronous handle and the pool.

use crate::error::{Error, Result};

/// Connection options.
///
/// `driver` and `db` are required; everything else has the documented
/// default. The same struct configures both [`crate::Adapter`] and
/// [`crate::ConnectionPool`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Driver name used to look up a backend in the driver registry.
    pub driver: String,
    /// Database name or path.
    pub db: String,
    /// Server host, empty for local/embedded backends.
    pub host: String,
    /// Server port, empty for local/embedded backends.
    pub port: String,
    /// Login user, defaults to the current OS user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Server timezone as a `±HH:MM` offset. `None` means `+00:00`.
    pub timezone: Option<String>,
}

impl Config {
    pub fn new(driver: &str, db: &str) -> Self {
        Self {
            driver: driver.to_string(),
            db: db.to_string(),
            host: String::new(),
            port: String::new(),
            user: std::env::var("USER").unwrap_or_default(),
            password: String::new(),
            timezone: None,
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: &str) -> Self {
        self.port = port.to_string();
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn timezone(mut self, offset: &str) -> Self {
        self.timezone = Some(offset.to_string());
        self
    }

    /// Validate the required options for the named public operation.
    pub(crate) fn validate(&self, operation: &'static str) -> Result<()> {
        if self.driver.is_empty() {
            return Err(Error::general(operation, "called without :driver"));
        }
        if self.db.is_empty() {
            return Err(Error::general(operation, "called without :db"));
        }
        Ok(())
    }

    /// Resolve the configured server timezone to seconds east of UTC.
    pub(crate) fn tzoffset(&self, operation: &'static str) -> Result<i32> {
        match self.timezone.as_deref() {
            None | Some("") => Ok(0),
            Some(zone) => parse_tzoffset(zone)
                .ok_or_else(|| Error::general(operation, format!("invalid timezone {zone:?}, expected ±HH:MM"))),
        }
    }
}

/// Parse a `±HH:MM` offset into seconds east of UTC.
pub(crate) fn parse_tzoffset(zone: &str) -> Option<i32> {
    let bytes = zone.as_bytes();
    if bytes.len() != 6 || bytes[3] != b':' {
        return None;
    }
    let sign = match bytes[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hours: i32 = zone[1..3].parse().ok()?;
    let minutes: i32 = zone[4..6].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}
