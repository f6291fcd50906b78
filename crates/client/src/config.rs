//! Client configuration.
//!
//! # Priority (highest to lowest)
//!
//! 1. Environment variables (`AIREMBR_*`, e.g. `AIREMBR_STORE_PATH`)
//! 2. Configuration file (`airembr.toml`)
//! 3. Default values

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{ClientError, Result};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "airembr.toml";

/// Which transport a [`MemoryClient`](crate::MemoryClient) talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    /// Embedded redb store.
    #[default]
    Local,
    /// A remote AiRembr API; the HTTP transport is supplied by the integrator.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_url: Option<String>,
    pub tenant: Option<String>,
    /// Deployment context sent with every request.
    pub context: String,
    pub production: bool,
    pub adapter: Adapter,
    /// Database file of the local adapter; in-memory when unset.
    pub store_path: Option<PathBuf>,
    pub page_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            tenant: None,
            context: "staging".to_string(),
            production: false,
            adapter: Adapter::Local,
            store_path: None,
            page_limit: 30,
        }
    }
}

impl ClientConfig {
    /// Load from `airembr.toml` in the working directory plus the environment.
    pub fn load() -> Result<Self> {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load from a specific file plus the environment. A missing file is not
    /// an error: defaults and environment still apply.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AIREMBR_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string over the defaults (no environment).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_limit == 0 {
            return Err(ClientError::Config(
                "page_limit must be greater than 0".to_string(),
            ));
        }
        if self.context.trim().is_empty() {
            return Err(ClientError::Config("context must not be empty".to_string()));
        }
        if self.adapter == Adapter::Remote && self.api_url.is_none() {
            return Err(ClientError::Config(
                "the remote adapter needs api_url".to_string(),
            ));
        }
        Ok(())
    }

    /// The context actually sent: `production` overrides the configured one.
    pub fn effective_context(&self) -> &str {
        if self.production {
            "production"
        } else {
            &self.context
        }
    }
}
