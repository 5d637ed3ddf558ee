//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (BURROW_*)
//! 2. Config file (server.toml)
//! 3. Default values (where applicable)

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::control_plane::ControlSettings;
use crate::session::SessionSettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "BURROW";

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the admin listener (control channels and tunnel streams)
    pub admin_port: Option<u16>,

    /// Ports for public HTTP traffic, one listener each
    pub public_ports: Vec<u16>,

    /// Root domain endpoints live under (e.g., "tunnel.example.com")
    pub root_domain: Option<String>,

    /// Seconds a new admin connection has to authenticate
    pub auth_timeout_secs: Option<u64>,

    /// Seconds a public connection has to send its request head
    pub head_timeout_secs: Option<u64>,

    /// Seconds a public request waits for its tunnel stream
    pub pairing_timeout_secs: Option<u64>,

    /// Seconds of silence after which a relay direction is closed
    pub relay_idle_timeout_secs: Option<u64>,

    /// Maximum control message line length in bytes
    pub max_line_length: Option<usize>,

    /// Maximum concurrent public requests per session
    pub max_pending_requests: Option<usize>,

    /// Accepted client tokens; empty means any client may authenticate
    pub auth_tokens: Vec<String>,

    /// TLS for the admin listener
    pub admin_tls: Option<TlsFiles>,

    /// TLS for the public listener
    pub public_tls: Option<TlsFiles>,
}

/// Certificate chain and private key, as PEM file paths
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
}

/// Fully resolved server configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub admin_port: u16,
    pub public_ports: Vec<u16>,
    pub root_domain: String,
    pub auth_timeout: Duration,
    pub head_timeout: Duration,
    pub pairing_timeout: Duration,
    pub relay_idle_timeout: Option<Duration>,
    pub max_line_length: usize,
    pub max_pending_requests: usize,
    pub auth_tokens: Vec<String>,
    pub admin_tls: Option<TlsFiles>,
    pub public_tls: Option<TlsFiles>,
}

impl ResolvedServerConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            pairing_timeout: self.pairing_timeout,
            max_pending_requests: self.max_pending_requests,
            relay_idle_timeout: self.relay_idle_timeout,
        }
    }

    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            auth_timeout: self.auth_timeout,
            max_line_length: self.max_line_length,
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Read a TLS cert/key pair from `<NAME>_CERT` and `<NAME>_KEY`
fn tls_from_env<F>(lookup: &F, name: &str) -> anyhow::Result<Option<TlsFiles>>
where
    F: Fn(&str) -> Option<String>,
{
    match (
        lookup(&format!("{}_CERT", name)),
        lookup(&format!("{}_KEY", name)),
    ) {
        (Some(cert), Some(key)) => Ok(Some(TlsFiles { cert, key })),
        (None, None) => Ok(None),
        _ => anyhow::bail!(
            "{prefix}_{name}_CERT and {prefix}_{name}_KEY must be set together",
            prefix = ENV_PREFIX
        ),
    }
}

/// Parse a comma-separated port list, skipping empty entries
fn parse_ports(name: &str, value: &str) -> anyhow::Result<Vec<u16>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse().map_err(|_| {
                anyhow::anyhow!("Invalid port in {}_{}: {:?}", ENV_PREFIX, name, p)
            })
        })
        .collect()
}

fn parse_var<T: std::str::FromStr>(name: &str, value: Option<String>) -> anyhow::Result<Option<T>> {
    value
        .map(|v| {
            v.trim().parse().map_err(|_| {
                anyhow::anyhow!("Invalid value for {}_{}: {:?}", ENV_PREFIX, name, v)
            })
        })
        .transpose()
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!("No config file at {}, using environment and defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(get_env)
    }

    /// Resolve with a custom lookup for `BURROW_*` variables (name without prefix)
    pub fn resolve_with<F>(self, lookup: F) -> anyhow::Result<ResolvedServerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Admin port: ENV > config > default 4000
        let admin_port = parse_var("ADMIN_PORT", lookup("ADMIN_PORT"))?
            .or(self.admin_port)
            .unwrap_or(4000);

        // Public ports: comma-separated ENV > config > default [8080]
        let public_ports = match lookup("PUBLIC_PORTS") {
            Some(value) => parse_ports("PUBLIC_PORTS", &value)?,
            None if !self.public_ports.is_empty() => self.public_ports,
            None => vec![8080],
        };
        if public_ports.is_empty() {
            anyhow::bail!("At least one public port is required");
        }
        for (i, port) in public_ports.iter().enumerate() {
            if public_ports[..i].contains(port) {
                anyhow::bail!("Public port {} listed twice", port);
            }
        }

        // Root domain: ENV > config > required
        let root_domain = lookup("ROOT_DOMAIN")
            .or(self.root_domain)
            .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("Root domain required. Set BURROW_ROOT_DOMAIN or root_domain in config")
            })?;

        let auth_timeout = parse_var("AUTH_TIMEOUT_SECS", lookup("AUTH_TIMEOUT_SECS"))?
            .or(self.auth_timeout_secs)
            .unwrap_or(30);
        let head_timeout = parse_var("HEAD_TIMEOUT_SECS", lookup("HEAD_TIMEOUT_SECS"))?
            .or(self.head_timeout_secs)
            .unwrap_or(30);
        let pairing_timeout = parse_var("PAIRING_TIMEOUT_SECS", lookup("PAIRING_TIMEOUT_SECS"))?
            .or(self.pairing_timeout_secs)
            .unwrap_or(10);
        let relay_idle_timeout =
            parse_var("RELAY_IDLE_TIMEOUT_SECS", lookup("RELAY_IDLE_TIMEOUT_SECS"))?
                .or(self.relay_idle_timeout_secs)
                .filter(|secs| *secs > 0);

        let max_line_length = parse_var("MAX_LINE_LENGTH", lookup("MAX_LINE_LENGTH"))?
            .or(self.max_line_length)
            .unwrap_or(burrow_protocol::DEFAULT_MAX_LINE_LENGTH);
        let max_pending_requests =
            parse_var("MAX_PENDING_REQUESTS", lookup("MAX_PENDING_REQUESTS"))?
                .or(self.max_pending_requests)
                .unwrap_or(256);

        if auth_timeout == 0 || head_timeout == 0 || pairing_timeout == 0 {
            anyhow::bail!("auth, head and pairing timeouts must be at least one second");
        }
        if max_pending_requests == 0 {
            anyhow::bail!("max_pending_requests must be at least 1");
        }

        // Tokens: comma-separated ENV > config
        let auth_tokens = lookup("AUTH_TOKENS")
            .map(|tokens| {
                tokens
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(self.auth_tokens);

        let admin_tls = tls_from_env(&lookup, "ADMIN")?.or(self.admin_tls);
        let public_tls = tls_from_env(&lookup, "PUBLIC")?.or(self.public_tls);

        Ok(ResolvedServerConfig {
            admin_port,
            public_ports,
            root_domain,
            auth_timeout: Duration::from_secs(auth_timeout),
            head_timeout: Duration::from_secs(head_timeout),
            pairing_timeout: Duration::from_secs(pairing_timeout),
            relay_idle_timeout: relay_idle_timeout.map(Duration::from_secs),
            max_line_length,
            max_pending_requests,
            auth_tokens,
            admin_tls,
            public_tls,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        Self::load(path)?.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "BURROW");
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig {
            root_domain: Some("tunnel.example.com".into()),
            ..ServerConfig::default()
        }
        .resolve_with(env_of(&[]))
        .unwrap();

        assert_eq!(config.admin_port, 4000);
        assert_eq!(config.public_ports, vec![8080]);
        assert_eq!(config.auth_timeout, Duration::from_secs(30));
        assert_eq!(config.head_timeout, Duration::from_secs(30));
        assert_eq!(config.pairing_timeout, Duration::from_secs(10));
        assert_eq!(config.relay_idle_timeout, None);
        assert_eq!(config.max_line_length, 64 * 1024);
        assert_eq!(config.max_pending_requests, 256);
        assert!(config.auth_tokens.is_empty());
        assert!(config.admin_tls.is_none());
    }

    #[test]
    fn test_root_domain_required() {
        let err = ServerConfig::default()
            .resolve_with(env_of(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("BURROW_ROOT_DOMAIN"));
    }

    #[test]
    fn test_parse_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            admin_port = 4443
            root_domain = "Tunnel.Example.com."
            pairing_timeout_secs = 3
            auth_tokens = ["a", "b"]

            [public_tls]
            cert = "/etc/burrow/cert.pem"
            key = "/etc/burrow/key.pem"
            "#,
        )
        .unwrap();

        let resolved = config.resolve_with(env_of(&[])).unwrap();
        assert_eq!(resolved.admin_port, 4443);
        assert_eq!(resolved.root_domain, "tunnel.example.com");
        assert_eq!(resolved.pairing_timeout, Duration::from_secs(3));
        assert_eq!(resolved.auth_tokens, vec!["a", "b"]);
        assert_eq!(
            resolved.public_tls,
            Some(TlsFiles {
                cert: "/etc/burrow/cert.pem".into(),
                key: "/etc/burrow/key.pem".into(),
            })
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let config = ServerConfig {
            root_domain: Some("file.example.com".into()),
            public_ports: vec![9000],
            auth_tokens: vec!["from-file".into()],
            ..ServerConfig::default()
        };

        let resolved = config
            .resolve_with(env_of(&[
                ("ROOT_DOMAIN", "env.example.com"),
                ("PUBLIC_PORTS", "9100"),
                ("AUTH_TOKENS", "one, two,"),
                ("RELAY_IDLE_TIMEOUT_SECS", "60"),
                ("ADMIN_CERT", "/tmp/c.pem"),
                ("ADMIN_KEY", "/tmp/k.pem"),
            ]))
            .unwrap();

        assert_eq!(resolved.root_domain, "env.example.com");
        assert_eq!(resolved.public_ports, vec![9100]);
        assert_eq!(resolved.auth_tokens, vec!["one", "two"]);
        assert_eq!(resolved.relay_idle_timeout, Some(Duration::from_secs(60)));
        assert!(resolved.admin_tls.is_some());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = || ServerConfig {
            root_domain: Some("example.com".into()),
            ..ServerConfig::default()
        };

        assert!(base()
            .resolve_with(env_of(&[("ADMIN_PORT", "not-a-port")]))
            .is_err());
        assert!(base()
            .resolve_with(env_of(&[("PAIRING_TIMEOUT_SECS", "0")]))
            .is_err());
        assert!(base()
            .resolve_with(env_of(&[("PUBLIC_CERT", "/tmp/c.pem")]))
            .is_err());
        assert!(base()
            .resolve_with(env_of(&[("HEAD_TIMEOUT_SECS", "0")]))
            .is_err());
    }

    #[test]
    fn test_multiple_public_ports() {
        let config: ServerConfig = toml::from_str(
            r#"
            root_domain = "example.com"
            public_ports = [80, 8080]
            "#,
        )
        .unwrap();
        let resolved = config.resolve_with(env_of(&[])).unwrap();
        assert_eq!(resolved.public_ports, vec![80, 8080]);

        let base = || ServerConfig {
            root_domain: Some("example.com".into()),
            public_ports: vec![80],
            ..ServerConfig::default()
        };

        let resolved = base()
            .resolve_with(env_of(&[("PUBLIC_PORTS", " 8080, 8443,")]))
            .unwrap();
        assert_eq!(resolved.public_ports, vec![8080, 8443]);

        let err = base()
            .resolve_with(env_of(&[("PUBLIC_PORTS", "8080,http")]))
            .unwrap_err();
        assert!(err.to_string().contains("BURROW_PUBLIC_PORTS"), "{err}");

        assert!(base()
            .resolve_with(env_of(&[("PUBLIC_PORTS", " , ")]))
            .is_err());
        assert!(base()
            .resolve_with(env_of(&[("PUBLIC_PORTS", "8080,8080")]))
            .is_err());
    }

    #[test]
    fn test_settings_projection() {
        let resolved = ServerConfig {
            root_domain: Some("example.com".into()),
            max_pending_requests: Some(8),
            ..ServerConfig::default()
        }
        .resolve_with(env_of(&[]))
        .unwrap();

        assert_eq!(resolved.session_settings().max_pending_requests, 8);
        assert_eq!(
            resolved.control_settings().auth_timeout,
            Duration::from_secs(30)
        );
    }
}
