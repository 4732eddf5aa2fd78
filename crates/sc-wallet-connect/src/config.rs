use crate::error::ConnectError;
use sc_api_types::{CHIA_MAINNET, CHIA_NAMESPACE, RequiredNamespace, WalletMethod};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl FromStr for Environment {
    type Err = ConnectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Development),
            "prod" | "production" => Ok(Environment::Production),
            other => Err(ConnectError::Config(format!("unknown environment '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlatformKind {
    #[default]
    Default,
    /// Embedded mobile browsers (iOS Safari, installed PWAs).
    Constrained,
}

impl FromStr for PlatformKind {
    type Err = ConnectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" | "desktop" => Ok(PlatformKind::Default),
            "constrained" | "ios" => Ok(PlatformKind::Constrained),
            other => Err(ConnectError::Config(format!("unknown platform '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub environment: Environment,
    pub platform: PlatformKind,
    pub chain_id: String,
    pub methods: Vec<String>,
    pub events: Vec<String>,
    /// Overrides the environment's request timeout when set.
    pub request_timeout: Option<Duration>,
    pub probe_timeout: Duration,
    pub approval_timeout: Duration,
    pub health_interval: Duration,
    pub health_max_failures: u32,
    pub storage_prefix: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            platform: PlatformKind::Default,
            chain_id: CHIA_MAINNET.to_owned(),
            methods: WalletMethod::ALL
                .iter()
                .map(|method| method.as_str().to_owned())
                .collect(),
            events: vec!["chainChanged".to_owned(), "accountsChanged".to_owned()],
            request_timeout: None,
            probe_timeout: Duration::from_secs(5),
            approval_timeout: Duration::from_secs(5 * 60),
            health_interval: Duration::from_secs(30),
            health_max_failures: 3,
            storage_prefix: "sage-connect.".to_owned(),
        }
    }
}

impl ConnectConfig {
    /// Default configuration overlaid with `SAGE_CONNECT_*` environment
    /// variables. Unparseable values keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SAGE_CONNECT_ENV") {
            config.environment = v.parse().unwrap_or(config.environment);
        }
        if let Ok(v) = std::env::var("SAGE_CONNECT_PLATFORM") {
            config.platform = v.parse().unwrap_or(config.platform);
        }
        if let Ok(v) = std::env::var("SAGE_CONNECT_CHAIN") {
            if !v.trim().is_empty() {
                config.chain_id = v.trim().to_owned();
            }
        }
        if let Some(ms) = env_millis("SAGE_CONNECT_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Some(ms);
        }
        if let Some(ms) = env_millis("SAGE_CONNECT_PROBE_TIMEOUT_MS") {
            config.probe_timeout = ms;
        }
        if let Some(ms) = env_millis("SAGE_CONNECT_APPROVAL_TIMEOUT_MS") {
            config.approval_timeout = ms;
        }
        if let Some(ms) = env_millis("SAGE_CONNECT_HEALTH_INTERVAL_MS") {
            config.health_interval = ms;
        }
        if let Ok(v) = std::env::var("SAGE_CONNECT_HEALTH_MAX_FAILURES") {
            config.health_max_failures = v.parse().unwrap_or(config.health_max_failures);
        }

        config
    }

    pub fn base_request_timeout(&self) -> Duration {
        self.request_timeout.unwrap_or(match self.environment {
            Environment::Development => Duration::from_secs(15),
            Environment::Production => Duration::from_secs(30),
        })
    }

    pub fn required_namespaces(&self) -> BTreeMap<String, RequiredNamespace> {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(
            CHIA_NAMESPACE.to_owned(),
            RequiredNamespace {
                chains: vec![self.chain_id.clone()],
                methods: self.methods.clone(),
                events: self.events.clone(),
            },
        );
        namespaces
    }

    pub fn validate(&self) -> Result<(), ConnectError> {
        if !self.chain_id.starts_with("chia:") || self.chain_id.len() <= "chia:".len() {
            return Err(ConnectError::Config(format!(
                "chain id '{}' is not a chia chain",
                self.chain_id
            )));
        }
        if self.methods.is_empty() {
            return Err(ConnectError::Config("at least one wallet method is required".to_owned()));
        }
        if self.probe_timeout.is_zero()
            || self.approval_timeout.is_zero()
            || self.health_interval.is_zero()
            || self.base_request_timeout().is_zero()
        {
            return Err(ConnectError::Config("timeouts and intervals must be non-zero".to_owned()));
        }
        if self.probe_timeout >= self.base_request_timeout()
            || self.base_request_timeout() >= self.approval_timeout
        {
            return Err(ConnectError::Config(
                "timeouts must satisfy probe < request < approval".to_owned(),
            ));
        }
        if self.health_max_failures == 0 {
            return Err(ConnectError::Config("health_max_failures must be at least 1".to_owned()));
        }
        Ok(())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
