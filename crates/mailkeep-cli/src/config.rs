use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use mailkeep_sync::GmailConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub imap: ImapSection,
    pub storage: StorageSection,
    #[serde(default)]
    pub gmail: GmailConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapSection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub path: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.imap.host.trim().is_empty() {
            bail!("imap.host is required");
        }
        if self.imap.port == 0 {
            bail!("imap.port must be between 1 and 65535");
        }
        if self.imap.username.is_empty() {
            bail!("imap.username is required");
        }
        if self.imap.password.is_empty() {
            bail!("imap.password is required");
        }
        if self.storage.path.trim().is_empty() {
            bail!("storage.path is required");
        }
        Ok(())
    }
}
