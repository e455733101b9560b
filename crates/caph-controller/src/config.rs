use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Management cluster kubeconfig; the pod's service account when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Restrict reconciliation to one namespace.
    pub watch_namespace: Option<String>,
    pub resync_interval: Duration,
    pub health_listen_addr: SocketAddr,
    pub vm_network_name: String,
    pub backoff_max: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            kubeconfig: non_empty("KUBECONFIG").map(PathBuf::from),
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            resync_interval: Duration::from_secs(parse(
                "RESYNC_INTERVAL_SECS",
                non_empty("RESYNC_INTERVAL_SECS"),
                30,
            )?),
            health_listen_addr: parse(
                "HEALTH_LISTEN_ADDR",
                non_empty("HEALTH_LISTEN_ADDR"),
                SocketAddr::from(([0, 0, 0, 0], 8081)),
            )?,
            vm_network_name: non_empty("VM_NETWORK_NAME").unwrap_or_else(|| "vlan1".into()),
            backoff_max: Duration::from_secs(parse(
                "BACKOFF_MAX_SECS",
                non_empty("BACKOFF_MAX_SECS"),
                300,
            )?),
        })
    }
}

fn parse<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}
