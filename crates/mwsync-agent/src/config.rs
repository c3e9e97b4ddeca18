//! Agent configuration.

use anyhow::{bail, Context, Result};
use mwsync_proto::DEFAULT_MAIN_TOPIC;
use mwsync_replica::ConnectionSettings;
use mwsync_transport::{BrokerSettings, BrokerUrl, CertificatePolicy, Credentials};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// MQTT client id; random when unset
    pub client_id: Option<Uuid>,

    /// Broker connection
    pub broker: BrokerConfig,

    /// Topic layout and scheduling
    pub sync: SyncConfig,

    /// Peer liveness
    pub heartbeat: HeartbeatConfig,
}

/// Broker connection configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker URL or `host[:port]`
    pub url: String,

    /// User name
    pub username: Option<String>,

    /// Password
    pub password: Option<String>,

    /// PEM bundle to validate the broker against
    pub ca_file: Option<PathBuf>,

    /// Accept any broker certificate
    pub tls_insecure: bool,
}

/// Topic layout and scheduling.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Prepended to every wire topic
    pub topic_prefix: String,

    /// Main topic of replicated properties
    pub main_topic: String,

    /// Scheduler tick
    pub tick: Duration,
}

/// Heartbeat timing.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Beat interval
    pub interval: Duration,

    /// Slack after a missed beat
    pub grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            broker: BrokerConfig {
                url: "tcp://localhost:1883".to_string(),
                username: None,
                password: None,
                ca_file: None,
                tls_insecure: false,
            },
            sync: SyncConfig {
                topic_prefix: String::new(),
                main_topic: DEFAULT_MAIN_TOPIC.to_string(),
                tick: Duration::from_millis(20),
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(2),
                grace: Duration::from_secs(2),
            },
        }
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid {name}: '{value}'"))
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MWSYNC_BROKER`: broker URL (`tcp://`, `mqtt://`, `ssl://`, `mqtts://` or `host[:port]`)
    /// - `MWSYNC_USERNAME` / `MWSYNC_PASSWORD`: broker credentials
    /// - `MWSYNC_TOPIC_PREFIX`: global topic prefix
    /// - `MWSYNC_MAIN_TOPIC`: main topic of replicated properties
    /// - `MWSYNC_CLIENT_ID`: client UUID
    /// - `MWSYNC_TICK_MS`: scheduler tick in milliseconds
    /// - `MWSYNC_HEARTBEAT_SECS` / `MWSYNC_HEARTBEAT_GRACE_SECS`: heartbeat timing
    /// - `MWSYNC_CA_FILE`: CA bundle for TLS
    /// - `MWSYNC_TLS_INSECURE`: `1` to accept any certificate
    ///
    /// # Errors
    ///
    /// Returns error if a variable does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("MWSYNC_CLIENT_ID") {
            config.client_id = Some(Uuid::parse_str(&id).context("Invalid MWSYNC_CLIENT_ID")?);
        }

        if let Ok(url) = std::env::var("MWSYNC_BROKER") {
            config.broker.url = url;
        }

        if let Ok(username) = std::env::var("MWSYNC_USERNAME") {
            config.broker.username = Some(username);
        }

        if let Ok(password) = std::env::var("MWSYNC_PASSWORD") {
            config.broker.password = Some(password);
        }

        if let Ok(path) = std::env::var("MWSYNC_CA_FILE") {
            config.broker.ca_file = Some(PathBuf::from(path));
        }

        if let Ok(flag) = std::env::var("MWSYNC_TLS_INSECURE") {
            config.broker.tls_insecure = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        if let Ok(prefix) = std::env::var("MWSYNC_TOPIC_PREFIX") {
            config.sync.topic_prefix = prefix;
        }

        if let Ok(main) = std::env::var("MWSYNC_MAIN_TOPIC") {
            config.sync.main_topic = main;
        }

        if let Ok(tick) = std::env::var("MWSYNC_TICK_MS") {
            config.sync.tick = Duration::from_millis(parse_u64("MWSYNC_TICK_MS", &tick)?.max(1));
        }

        if let Ok(secs) = std::env::var("MWSYNC_HEARTBEAT_SECS") {
            config.heartbeat.interval = Duration::from_secs(parse_u64("MWSYNC_HEARTBEAT_SECS", &secs)?);
        }

        if let Ok(secs) = std::env::var("MWSYNC_HEARTBEAT_GRACE_SECS") {
            config.heartbeat.grace = Duration::from_secs(parse_u64("MWSYNC_HEARTBEAT_GRACE_SECS", &secs)?);
        }

        Ok(config)
    }

    /// Transport settings derived from the broker section.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid or the TLS options conflict.
    pub fn broker_settings(&self) -> Result<BrokerSettings> {
        let url = BrokerUrl::parse(&self.broker.url)?;

        let tls = match (&self.broker.ca_file, self.broker.tls_insecure) {
            (Some(_), true) => bail!("MWSYNC_CA_FILE and MWSYNC_TLS_INSECURE are mutually exclusive"),
            (Some(path), false) => CertificatePolicy::CaFile(path.clone()),
            (None, true) => CertificatePolicy::TrustAll,
            (None, false) if url.tls => CertificatePolicy::SystemRoots,
            (None, false) => CertificatePolicy::Disabled,
        };

        Ok(BrokerSettings {
            host: url.host.clone(),
            port: url.port,
            tls,
            ..BrokerSettings::default()
        })
    }

    /// Connection-manager settings.
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        let credentials = self.broker.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.broker.password.clone().unwrap_or_default(),
        });

        ConnectionSettings {
            global_prefix: self.sync.topic_prefix.clone(),
            credentials,
            ..ConnectionSettings::default()
        }
    }
}
