use anyhow::{Context, Result};

use crate::config::FleetConfig;

pub struct ConfigShowCommand {
    config: FleetConfig,
}

impl ConfigShowCommand {
    pub fn new(config: FleetConfig) -> Self {
        Self { config }
    }

    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("failed to render configuration as TOML")
    }

    pub async fn execute(&self) -> Result<()> {
        print!("{}", self.render()?);
        Ok(())
    }
}
