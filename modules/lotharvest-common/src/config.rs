use std::env;

use tracing::info;

/// One egress identity: an HTTP proxy host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub host: String,
    pub port: u16,
}

impl ProxyDescriptor {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Login credentials resolved from the environment for one site.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy descriptors for the rotator; empty means direct-only.
    pub proxies: Vec<ProxyDescriptor>,
    /// Override path to the Chromium binary, if the default lookup fails.
    pub chrome_bin: Option<String>,
}

const DEFAULT_PROXY_PORT: u16 = 3128;

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            proxies: parse_proxies(env::var("PROXY_HOSTS").ok().as_deref()),
            chrome_bin: env::var("CHROME_BIN").ok(),
        }
    }

    /// Credentials for one site, from `HARVEST_EMAIL_<KEY>` /
    /// `HARVEST_PASSWORD_<KEY>`. Panics with a clear message if missing —
    /// a site without credentials cannot be harvested at all.
    pub fn credentials(&self, site_key: &str) -> Credentials {
        let key = site_key.to_uppercase();
        Credentials {
            user_id: required_env(&format!("HARVEST_EMAIL_{key}")),
            password: required_env(&format!("HARVEST_PASSWORD_{key}")),
        }
    }

    /// Log the loaded config without secret material.
    pub fn log_redacted(&self) {
        info!(
            proxies = self.proxies.len(),
            chrome_bin = self.chrome_bin.as_deref().unwrap_or("(default)"),
            "Config loaded"
        );
    }
}

fn parse_proxies(raw: Option<&str>) -> Vec<ProxyDescriptor> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((host, port)) => ProxyDescriptor {
                host: host.to_string(),
                port: port.parse().unwrap_or(DEFAULT_PROXY_PORT),
            },
            None => ProxyDescriptor {
                host: entry.to_string(),
                port: DEFAULT_PROXY_PORT,
            },
        })
        .collect()
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_list_with_defaults() {
        let proxies = parse_proxies(Some("10.0.0.1, 10.0.0.2:8080,,"));
        assert_eq!(
            proxies,
            vec![
                ProxyDescriptor {
                    host: "10.0.0.1".to_string(),
                    port: 3128
                },
                ProxyDescriptor {
                    host: "10.0.0.2".to_string(),
                    port: 8080
                },
            ]
        );
    }

    #[test]
    fn empty_env_means_direct_only() {
        assert!(parse_proxies(None).is_empty());
    }
}
