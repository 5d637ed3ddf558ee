use std::path::Path;

use serde::Deserialize;

/// Client configuration (parsed from TOML)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker admin address (host:port)
    pub server_addr: Option<String>,

    /// Local service address to forward to
    pub local_addr: Option<String>,

    /// Requested endpoint id (None = assigned by the server)
    pub endpoint_id: Option<String>,

    /// Auth token, if the broker requires one
    pub token: Option<String>,

    /// CA certificate file; enables TLS to the broker
    #[serde(alias = "ca_cert_path")]
    pub ca_cert: Option<String>,

    /// TLS server name, when it differs from the server host
    pub server_name: Option<String>,

    /// Seconds between keepalive pings (0 disables)
    pub keepalive_secs: Option<u64>,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Auth params sent with the `auth` command
    pub fn auth_params(&self) -> serde_json::Value {
        let mut params = serde_json::Map::new();
        if let Some(token) = &self.token {
            params.insert("token".into(), token.clone().into());
        }
        if let Some(endpoint_id) = &self.endpoint_id {
            params.insert("endpointId".into(), endpoint_id.clone().into());
        }
        serde_json::Value::Object(params)
    }
}
