use std::env;

use anyhow::Context;
use chrono_tz::Tz;

use crate::error::ConfigError;

pub const TIMEZONE_VAR: &str = "CARE_DASHBOARD_TZ";

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub timezone: Tz,
}

impl Settings {
    /// `timezone_override` wins over the environment when given.
    pub fn from_env(timezone_override: Option<&str>) -> Result<Self, ConfigError> {
        let timezone = match timezone_override {
            Some(name) => parse_timezone(name)?,
            None => match env::var(TIMEZONE_VAR) {
                Ok(name) => parse_timezone(&name)?,
                Err(_) => chrono_tz::UTC,
            },
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            timezone,
        })
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::InvalidTimezone(name.to_string()))
}
