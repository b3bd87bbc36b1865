use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "xword/0.1";
pub const DEFAULT_XMLRPC_PATH: &str = "/xwiki/xmlrpc/confluence";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct XWordConfig {
    #[serde(default)]
    pub wiki: WikiSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub xmlrpc_path: Option<String>,
    pub user_agent: Option<String>,
}

impl XWordConfig {
    /// Resolve the wiki base URL: env XWIKI_URL > config.
    pub fn wiki_url(&self) -> Option<String> {
        if let Ok(value) = env::var("XWIKI_URL") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        self.wiki.url.clone()
    }

    /// Resolve the XML-RPC path: env XWIKI_XMLRPC_PATH > config > default.
    pub fn xmlrpc_path(&self) -> String {
        if let Ok(value) = env::var("XWIKI_XMLRPC_PATH") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.wiki
            .xmlrpc_path
            .clone()
            .unwrap_or_else(|| DEFAULT_XMLRPC_PATH.to_string())
    }

    /// Resolve user agent: env XWIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("XWIKI_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Full XML-RPC endpoint: env XWIKI_ENDPOINT > base URL + path.
    pub fn endpoint(&self) -> Option<String> {
        if let Ok(value) = env::var("XWIKI_ENDPOINT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        let base = self.wiki_url()?;
        let path = self.xmlrpc_path();
        Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

/// Credentials live in the environment only, never in the config file.
pub fn credentials_from_env() -> Option<(String, String)> {
    let username = env::var("XWIKI_USER").ok()?;
    let password = env::var("XWIKI_PASSWORD").ok()?;
    if username.trim().is_empty() {
        return None;
    }
    Some((username, password))
}

/// Load and parse an XWordConfig from a TOML file. Returns default if the file
/// doesn't exist.
pub fn load_config(config_path: &Path) -> Result<XWordConfig> {
    if !config_path.exists() {
        return Ok(XWordConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: XWordConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
