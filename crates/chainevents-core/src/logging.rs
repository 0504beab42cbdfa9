//! Log output for the event service.
//!
//! [`LogConfig`] is part of [`EventServiceConfig`](crate::EventServiceConfig)
//! under `log`, so one document configures both. A set `RUST_LOG` takes
//! precedence over the configured levels.
//!
//! ```
//! use chainevents_core::EventServiceConfig;
//!
//! let config = EventServiceConfig::from_json(
//!     r#"{"log": {"level": "warn", "components": {"client": "debug"}}}"#,
//! )?;
//! chainevents_core::logging::init_tracing(&config.log)?;
//! # Ok::<(), chainevents_core::EventError>(())
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::EventError;

/// A part of the event service whose verbosity can be set on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Dispatcher,
    Resolver,
    Client,
    ConnCache,
}

impl Component {
    /// The tracing target prefix of the component.
    pub fn target(self) -> &'static str {
        match self {
            Self::Dispatcher => "chainevents_core::dispatcher",
            Self::Resolver => "chainevents_core::resolver",
            Self::Client => "chainevents_client",
            Self::ConnCache => "chainevents_conncache",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for everything without a component override.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub components: BTreeMap<Component, String>,
    /// JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), EventError> {
        parse_level(&self.level)?;
        for level in self.components.values() {
            parse_level(level)?;
        }
        Ok(())
    }

    /// Filter directives, e.g. `"info,chainevents_client=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.to_lowercase();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.target(), level.to_lowercase()));
        }
        directives
    }
}

fn parse_level(level: &str) -> Result<LevelFilter, EventError> {
    LevelFilter::from_str(level)
        .map_err(|_| EventError::Config(format!("invalid log level [{level}]")))
}

/// Install the global subscriber. A subscriber that is already installed is
/// left in place.
pub fn init_tracing(config: &LogConfig) -> Result<(), EventError> {
    config.validate()?;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())
            .map_err(|e| EventError::Config(format!("invalid log directives: {e}")))?,
    };

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing already initialised");
    }
    Ok(())
}
