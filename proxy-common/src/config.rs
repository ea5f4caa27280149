//! Process-wide configuration, loaded once at startup.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_restart_timeout() -> u64 {
    250
}

fn default_workers() -> usize {
    1
}

fn default_keepalive() -> u64 {
    60
}

fn default_reneg_window() -> u64 {
    600
}

fn default_reneg_limit() -> usize {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_restart_timeout", rename = "restart_timeout")]
    pub restart_timeout_ms: u64,
    pub frontend: FrontendCfg,
    pub backend: BackendCfg,
    #[serde(default)]
    pub sni: Option<PoolCfg>,
    #[serde(default)]
    pub stapling: Option<PoolCfg>,
    #[serde(default)]
    pub contexts: Vec<ContextCfg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendCfg {
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_security")]
    pub security: String,
    #[serde(default)]
    pub npn: Vec<String>,
    #[serde(default)]
    pub ciphers: Option<String>,
    #[serde(default)]
    pub ecdh: Option<String>,
    pub cert: String,
    pub key: String,
    #[serde(default = "default_reneg_window")]
    pub reneg_window: u64,
    #[serde(default = "default_reneg_limit")]
    pub reneg_limit: usize,
    #[serde(default)]
    pub proxyline: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default = "default_true")]
    pub server_preference: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_security() -> String {
    "tls1.2".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCfg {
    pub port: u16,
    pub host: String,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCfg {
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCfg {
    pub servername: String,
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub npn: Option<Vec<String>>,
    #[serde(default)]
    pub ciphers: Option<String>,
    #[serde(default)]
    pub ecdh: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: default_workers(),
            restart_timeout_ms: default_restart_timeout(),
            frontend: FrontendCfg {
                port: 443,
                host: default_host(),
                security: default_security(),
                npn: Vec::new(),
                ciphers: None,
                ecdh: None,
                cert: "keys/cert.pem".to_string(),
                key: "keys/key.pem".to_string(),
                reneg_window: default_reneg_window(),
                reneg_limit: default_reneg_limit(),
                proxyline: false,
                keepalive: default_keepalive(),
                server_preference: true,
            },
            backend: BackendCfg {
                port: 8000,
                host: "127.0.0.1".to_string(),
                keepalive: default_keepalive(),
            },
            sni: None,
            stapling: None,
            contexts: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| ProxyError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants required before any TLS context is built:
    /// unique non-empty servernames, and every NPN entry is a non-empty
    /// string.
    pub fn validate(&self) -> Result<()> {
        verify_npn(&self.frontend.npn)?;

        let mut seen = std::collections::HashSet::new();
        for ctx in &self.contexts {
            if ctx.servername.is_empty() {
                return Err(ProxyError::Config("context servername must be non-empty".into()));
            }
            let key = ctx.servername.to_ascii_lowercase();
            if !seen.insert(key) {
                return Err(ProxyError::Config(format!(
                    "duplicate context servername '{}'",
                    ctx.servername
                )));
            }
            if let Some(npn) = &ctx.npn {
                verify_npn(npn)?;
            }
        }

        if let Some(pool) = &self.sni {
            verify_pool(pool, "sni")?;
        }
        if let Some(pool) = &self.stapling {
            verify_pool(pool, "stapling")?;
        }

        Ok(())
    }
}

fn verify_npn(npn: &[String]) -> Result<()> {
    for proto in npn {
        if proto.is_empty() || proto.len() > 255 {
            return Err(ProxyError::Config(format!(
                "invalid NPN/ALPN protocol name '{proto}'"
            )));
        }
    }
    Ok(())
}

fn verify_pool(pool: &PoolCfg, name: &str) -> Result<()> {
    if pool.enabled && !pool.query.contains("%s") {
        return Err(ProxyError::Config(format!(
            "{name}.query must contain a '%s' placeholder"
        )));
    }
    Ok(())
}
