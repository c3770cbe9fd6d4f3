use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, StoresConfig};

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration without validating it, for callers that apply
    /// command-line overrides before validation.
    pub fn load_unvalidated<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Apply the `--session-stores` / `--local-site-name` command-line
    /// overrides on top of the file configuration. Callers validate
    /// afterwards.
    pub fn apply_store_overrides(
        &mut self,
        session_stores: Option<&str>,
        local_site_name: Option<&str>,
    ) -> Result<()> {
        if let Some(arg) = session_stores {
            self.stores.session_stores = StoresConfig::parse_store_arg(arg)
                .with_context(|| format!("invalid --session-stores value: {}", arg))?;
        }

        if let Some(site) = local_site_name {
            self.stores.local_site_name = site.to_string();
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.stores.session_stores.is_empty() {
            anyhow::bail!("at least one session store must be defined");
        }

        // Site names must be unique
        let mut site_names = std::collections::HashSet::new();
        for store in &self.stores.session_stores {
            if !site_names.insert(&store.site) {
                anyhow::bail!("duplicate session store site: {}", store.site);
            }
        }

        // The local site must be among the configured stores; a gateway
        // without a local store cannot run.
        if self.stores.split_local().is_none() {
            anyhow::bail!(
                "local site '{}' is not among the configured session stores",
                self.stores.local_site_name
            );
        }

        if self.billing.realm.is_empty() {
            anyhow::bail!("billing realm must not be empty");
        }

        if self.billing.origin_host.is_empty() || self.billing.origin_realm.is_empty() {
            anyhow::bail!("billing origin_host and origin_realm must not be empty");
        }

        if self.billing.max_peers == 0 {
            anyhow::bail!("max_peers must be at least 1");
        }

        if self.load.min_token_rate <= 0.0 {
            anyhow::bail!("min_token_rate must be positive");
        }

        if self.load.max_token_rate != 0.0 && self.load.max_token_rate < self.load.min_token_rate {
            anyhow::bail!("max_token_rate must be at least min_token_rate");
        }

        info!("configuration validated successfully");
        Ok(())
    }
}
