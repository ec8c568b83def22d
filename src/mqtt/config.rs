use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default prefix substituted for `{basetopic}` when none is configured.
pub const DEFAULT_BASETOPIC: &str = "ispMQTT";

/// How the client reaches the broker.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    #[default]
    Websocket,
}

/// Connection and topic settings for the MQTT wrapper.
///
/// Host and port are optional on purpose: without them the wrapper still
/// records subscriptions but never opens a connection.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport: TransportKind,
    /// Path appended to the websocket URL (e.g. `/mqtt`)
    pub path: String,
    pub username: String,
    pub password: String,
    pub basetopic: String,
    /// Client ids are built as `<client_prefix>_<unix millis>`
    pub client_prefix: String,
    pub keep_alive_secs: u64,
    /// Pause between two reconnect attempts of the event loop
    pub reconnect_delay_secs: u64,
    /// Capacity of the request channel towards the client library and the worker
    pub channel_capacity: usize,
    pub status: StatusConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            transport: TransportKind::default(),
            path: String::new(),
            username: String::new(),
            password: String::new(),
            basetopic: DEFAULT_BASETOPIC.to_string(),
            client_prefix: "ispMQTTid".to_string(),
            keep_alive_secs: 60,
            reconnect_delay_secs: 1,
            channel_capacity: 100,
            status: StatusConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Host and port, if both are configured.
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match (self.host.as_deref(), self.port) {
            (Some(host), Some(port)) if !host.is_empty() => Some((host, port)),
            _ => None,
        }
    }

    /// Broker address handed to the client library.
    ///
    /// For websockets the library expects the full URL, for TCP only the host.
    pub fn broker_addr(&self) -> Option<(String, u16)> {
        let (host, port) = self.endpoint()?;
        let addr = match self.transport {
            TransportKind::Tcp => host.to_string(),
            TransportKind::Websocket => {
                let path = if self.path.is_empty() || self.path.starts_with('/') {
                    self.path.clone()
                } else {
                    format!("/{}", self.path)
                };
                format!("ws://{}:{}{}", host, port, path)
            }
        };
        Some((addr, port))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Status announcements on `<basetopic>/stat/...`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    /// Reported as `name` in every status payload
    pub name: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_requires_host_and_port() {
        let mut config = MqttConfig::default();
        assert!(config.endpoint().is_none());

        config.host = Some("localhost".into());
        assert!(config.endpoint().is_none());

        config.port = Some(9001);
        assert_eq!(config.endpoint(), Some(("localhost", 9001)));

        config.host = Some(String::new());
        assert!(config.endpoint().is_none());
    }

    #[test]
    fn websocket_address_includes_path() {
        let config = MqttConfig {
            host: Some("broker.local".into()),
            port: Some(9001),
            path: "mqtt".into(),
            ..Default::default()
        };
        assert_eq!(
            config.broker_addr(),
            Some(("ws://broker.local:9001/mqtt".to_string(), 9001))
        );

        let tcp = MqttConfig {
            transport: TransportKind::Tcp,
            port: Some(1883),
            ..config
        };
        assert_eq!(tcp.broker_addr(), Some(("broker.local".to_string(), 1883)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: MqttConfig = toml::from_str(
            r#"
            host = "10.0.0.2"
            port = 1883
            transport = "tcp"

            [status]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.basetopic, DEFAULT_BASETOPIC);
        assert_eq!(config.keep_alive_secs, 60);
        assert!(config.status.enabled);
        assert_eq!(config.status.name, "topicwire");
    }
}
