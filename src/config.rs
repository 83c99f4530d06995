use std::{fs::File, net::SocketAddr, path::{Path, PathBuf}, time::Duration};

use anyhow::Context as _;
use pathproxy_core::forward::ForwarderOptions;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: SocketAddr,
    /// Must start and end with `/`
    pub route_prefix: String,
    pub ssl: Option<Ssl>,
    pub upstream: UpstreamOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            route_prefix: "/proxy/".to_owned(),
            ssl: None,
            upstream: UpstreamOptions::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Ssl {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamOptions {
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        let defaults = ForwarderOptions::default();
        Self {
            pool_idle_timeout_secs: defaults.pool_idle_timeout.as_secs(),
            pool_max_idle_per_host: defaults.pool_max_idle_per_host,
        }
    }
}

impl From<&UpstreamOptions> for ForwarderOptions {
    fn from(options: &UpstreamOptions) -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(options.pool_idle_timeout_secs),
            pool_max_idle_per_host: options.pool_max_idle_per_host,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open config {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.route_prefix, "/proxy/");
        assert!(config.ssl.is_none());
        assert_eq!(config.upstream.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            "listen: 127.0.0.1:9000\nupstream:\n  pool_max_idle_per_host: 4\n",
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.route_prefix, "/proxy/");
        assert_eq!(config.upstream.pool_max_idle_per_host, 4);
        assert_eq!(config.upstream.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_ssl_section() {
        let config: Config = serde_yaml::from_str(
            "route_prefix: /r/\nssl:\n  certificate: cert.pem\n  private_key: key.pem\n",
        )
        .unwrap();
        let ssl = config.ssl.unwrap();
        assert_eq!(ssl.certificate, PathBuf::from("cert.pem"));
        assert_eq!(config.route_prefix, "/r/");
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_yaml::from_str::<Config>("prefix: /proxy/\n").is_err());
    }
}
