//! Global settings in `config.json`

use crate::error::Result;
use crate::store::{read_json_or_default, write_json_atomic};
use hooktunnel_runtime::BundledNode;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// Size of the window scanned for free public ports
pub const PORT_SCAN_SPAN: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Appended to subdomains to form the public host
    pub domain: String,
    /// First port tried when choosing a public port
    pub base_port: u16,
    /// Reserved for nginx integration
    pub nginx_enabled: bool,
    pub nginx_config_path: String,
    /// Portable Node.js installed on demand
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundled_node: Option<BundledNode>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            base_port: 8000,
            nginx_enabled: false,
            nginx_config_path: "/etc/nginx/sites-available".to_string(),
            bundled_node: None,
        }
    }
}

impl GlobalConfig {
    /// Load `path`, writing the defaults first if it does not exist
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        read_json_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Candidate public ports, `[base_port, base_port + 1000)` clamped to u16
    pub fn port_range(&self) -> Range<u16> {
        self.base_port..self.base_port.saturating_add(PORT_SCAN_SPAN)
    }
}
