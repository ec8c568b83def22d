//! Connection-independent state of the MQTT wrapper.
//!
//! `Session` owns the subscription table and the connection flag and reacts to
//! the events the client library reports. It never blocks: every broker
//! request is handed to a [`MqttTransport`] which only enqueues it.

use super::config::{MqttConfig, StatusConfig};
use super::error::MqttError;
use super::message_manager::{ArrivedMessage, Payload};
use super::subscription::{Callback, SubscribeOptions, Subscription, SubscriptionTable};
use super::topic::{apply_basetopic, strip_basetopic};
use rumqttc::QoS;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, warn};

/// Non-blocking access to the broker.
pub trait MqttTransport: Send {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), MqttError>;
    fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError>;
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;
    fn disconnect(&mut self) -> Result<(), MqttError>;
}

impl MqttTransport for rumqttc::AsyncClient {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        Ok(self.try_subscribe(topic, qos)?)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        Ok(self.try_unsubscribe(topic)?)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        Ok(self.try_publish(topic, qos, retain, payload)?)
    }

    fn disconnect(&mut self) -> Result<(), MqttError> {
        Ok(self.try_disconnect()?)
    }
}

/// Events of the client library, reduced to what the session needs.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    /// Connection failed; before the first connect this is a refused attempt
    ConnectionLost(String),
    /// A subscribe request left the client with this packet id
    SubscribeSent(u16),
    SubscribeAck { pkid: u16, accepted: bool },
    UnsubscribeAck(u16),
    Message { topic: String, payload: Vec<u8> },
}

pub struct Session<T: MqttTransport> {
    basetopic: String,
    client_id: String,
    connected: bool,
    transport: Option<T>,
    subscriptions: SubscriptionTable,
    /// Topics whose subscribe request is queued but has no packet id yet.
    /// The client library replays these after a reconnect, so they survive it.
    awaiting_pkid: VecDeque<String>,
    /// Subscribe requests on the wire, by packet id
    awaiting_ack: HashMap<u16, String>,
    status: StatusConfig,
}

impl<T: MqttTransport> Session<T> {
    pub fn new(config: &MqttConfig, client_id: String, transport: Option<T>) -> Self {
        Self {
            basetopic: config.basetopic.clone(),
            client_id,
            connected: false,
            transport,
            subscriptions: SubscriptionTable::default(),
            awaiting_pkid: VecDeque::new(),
            awaiting_ack: HashMap::new(),
            status: config.status.clone(),
        }
    }

    pub fn basetopic(&self) -> &str {
        &self.basetopic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn resolve_topic(&self, template: &str) -> String {
        apply_basetopic(template, &self.basetopic)
    }

    /// Records a subscription and sends it right away when connected.
    ///
    /// Returns the resolved topic, or `None` if the topic is empty or already
    /// subscribed and acknowledged.
    pub fn subscribe(
        &mut self,
        topic: &str,
        callback: Option<Callback>,
        options: SubscribeOptions,
    ) -> Option<String> {
        if topic.is_empty() {
            warn!("mqtt.subscribe: empty topic ignored");
            return None;
        }
        let topic = self.resolve_topic(topic);

        if self.subscriptions.get(&topic).is_some_and(|s| s.ready) {
            debug!("mqtt.subscribe: {} already subscribed", topic);
            return None;
        }

        self.subscriptions
            .insert(Subscription::new(&topic, callback, options));

        if self.connected {
            self.send_subscribe(&topic, options.qos);
        } else {
            debug!("mqtt.subscribe: {} deferred until connected", topic);
        }
        Some(topic)
    }

    /// Removes a subscription; the broker is only told when it had acknowledged it.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }
        let topic = self.resolve_topic(topic);

        let Some(subscription) = self.subscriptions.remove(&topic) else {
            debug!("mqtt.unsubscribe: {} not subscribed", topic);
            return false;
        };

        if subscription.ready {
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.unsubscribe(&topic) {
                    error!("mqtt.unsubscribe {} failed: {}", topic, e);
                }
            }
        }
        true
    }

    /// Publishes `payload`; dropped silently while disconnected.
    pub fn publish(&mut self, topic: &str, payload: Payload, qos: Option<QoS>, retain: bool) {
        if topic.is_empty() || !self.connected {
            debug!("mqtt.publish: not connected or empty topic, dropping message");
            return;
        }
        let topic = self.resolve_topic(topic);
        self.send(&topic, payload, qos.unwrap_or(QoS::AtMostOnce), retain);
    }

    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => self.on_connect(),
            LinkEvent::ConnectionLost(reason) => self.on_connection_lost(&reason),
            LinkEvent::SubscribeSent(pkid) => self.on_subscribe_sent(pkid),
            LinkEvent::SubscribeAck { pkid, accepted } => self.on_subscribe_ack(pkid, accepted),
            LinkEvent::UnsubscribeAck(pkid) => debug!("mqtt.unsubscribe acknowledged ({})", pkid),
            LinkEvent::Message { topic, payload } => self.on_message(&topic, &payload),
        }
    }

    fn on_connect(&mut self) {
        info!("mqtt.connected as {}", self.client_id);
        self.connected = true;
        self.init_subscriptions();
        self.announce_running();
    }

    fn on_failure(&mut self, reason: &str) {
        warn!("mqtt.onFailure: {}", reason);
    }

    fn on_connection_lost(&mut self, reason: &str) {
        if !self.connected {
            self.on_failure(reason);
            return;
        }
        info!("mqtt.onConnectionLost: {}", reason);
        self.connected = false;
        // requests already on the wire died with the connection
        self.awaiting_ack.clear();
        // acknowledgments belong to the lost session
        for subscription in self.subscriptions.iter_mut() {
            subscription.ready = false;
        }
    }

    fn on_subscribe_sent(&mut self, pkid: u16) {
        match self.awaiting_pkid.pop_front() {
            Some(topic) => {
                self.awaiting_ack.insert(pkid, topic);
            }
            None => debug!("mqtt: subscribe {} left without a tracked topic", pkid),
        }
    }

    fn on_subscribe_ack(&mut self, pkid: u16, accepted: bool) {
        let Some(topic) = self.awaiting_ack.remove(&pkid) else {
            debug!("mqtt: unexpected subscribe acknowledgment {}", pkid);
            return;
        };
        if !accepted {
            warn!("mqtt.subscribe {} rejected by broker", topic);
            return;
        }
        if let Some(subscription) = self.subscriptions.get_mut(&topic) {
            debug!("mqtt.subscribe {} ready", topic);
            subscription.ready = true;
        }
    }

    /// Routes `raw` to the first subscription whose pattern covers `topic`.
    fn on_message(&mut self, topic: &str, raw: &[u8]) {
        let Some(subscription) = self.subscriptions.find_match(topic) else {
            debug!("mqtt.onMessageArrived: no subscription for {}", topic);
            return;
        };
        let Some(callback) = subscription.callback.as_ref() else {
            return;
        };

        let message = ArrivedMessage::decode(topic, strip_basetopic(topic, &self.basetopic), raw);
        callback(&message);
    }

    /// Sends every recorded subscription to the broker, except those still
    /// queued in the client library.
    fn init_subscriptions(&mut self) {
        let pending: Vec<(String, QoS)> = self
            .subscriptions
            .iter()
            .filter(|s| !self.awaiting_pkid.iter().any(|topic| topic == s.topic()))
            .map(|s| (s.topic().to_string(), s.options.qos))
            .collect();
        for (topic, qos) in pending {
            self.send_subscribe(&topic, qos);
        }
    }

    fn send_subscribe(&mut self, topic: &str, qos: QoS) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.subscribe(topic, qos) {
            Ok(()) => self.awaiting_pkid.push_back(topic.to_string()),
            Err(e) => error!("mqtt.subscribe {} failed: {}", topic, e),
        }
    }

    fn send(&mut self, topic: &str, payload: Payload, qos: QoS, retain: bool) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.publish(topic, payload.into_bytes(), qos, retain) {
            error!("mqtt.publish {} failed: {}", topic, e);
        }
    }

    fn announce_running(&mut self) {
        if !self.status.enabled {
            return;
        }
        let payload = json!({
            "mode": "running",
            "name": self.status.name,
            "pid": std::process::id(),
        });
        let topic = status_topic(&self.basetopic, "status");
        self.send(&topic, Payload::Json(payload), QoS::AtMostOnce, false);
    }

    /// Announces the shutdown (if enabled) and disconnects.
    pub fn shutdown(&mut self) {
        if self.connected && self.status.enabled {
            let topic = status_topic(&self.basetopic, "connected");
            info!("mqtt.stopping and publish: {}", topic);
            let payload = json!({ "mode": "stopped", "name": self.status.name });
            self.send(&topic, Payload::Json(payload), QoS::AtMostOnce, false);
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.disconnect() {
                error!("mqtt.shutdown error: {}", e);
            }
        }
        self.connected = false;
    }
}

/// `<basetopic>/stat/<leaf>`
pub fn status_topic(basetopic: &str, leaf: &str) -> String {
    format!("{}/stat/{}", basetopic, leaf)
}

/// Payload of the last will registered at connect time.
pub fn last_will_payload(status: &StatusConfig) -> Vec<u8> {
    Payload::Json(json!({ "mode": "stopped-lastwill", "name": status.name })).into_bytes()
}
