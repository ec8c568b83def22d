use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing,
    QoS, SubscribeReasonCode, Transport,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, TransportKind};
use super::error::MqttError;
use super::message_manager::{ArrivedMessage, Payload};
use super::session::{last_will_payload, status_topic, LinkEvent, MqttTransport, Session};
use super::subscription::{Callback, SubscribeOptions};
use super::topic::apply_basetopic;

/// Upper bound for flushing the last requests to the broker on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Requests from [`MqttHandle`] to the worker task.
pub enum MqttAction {
    Subscribe {
        topic: String,
        callback: Option<Callback>,
        options: SubscribeOptions,
        response_tx: oneshot::Sender<Option<String>>,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: Payload,
        qos: Option<QoS>,
        retain: bool,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Cloneable front end of the MQTT wrapper.
///
/// All state lives on one worker task; the handle only sends actions to it.
/// Subscription callbacks run on that task, one message at a time.
#[derive(Clone, Debug)]
pub struct MqttHandle {
    tx: mpsc::Sender<MqttAction>,
    connected: watch::Receiver<bool>,
    basetopic: String,
    client_id: String,
    has_client: bool,
    cancel: CancellationToken,
}

/// Returned by [`MqttHandle::subscribe`]; `remove` unsubscribes the topic.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    topic: String,
    handle: MqttHandle,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn remove(self) {
        self.handle.unsubscribe(&self.topic).await;
    }
}

/// `<prefix>_<unix millis>`
pub fn make_client_id(prefix: &str) -> String {
    format!("{}_{}", prefix, chrono::Utc::now().timestamp_millis())
}

impl MqttHandle {
    /// Builds the client from `config` and starts the worker.
    ///
    /// Without host and port no client is created: subscriptions are recorded
    /// but nothing is ever sent. Must be called inside a tokio runtime.
    pub fn spawn(config: &MqttConfig) -> Self {
        let client_id = make_client_id(&config.client_prefix);
        let cancel = CancellationToken::new();

        let (client, link_rx) = match mqtt_options(config, &client_id) {
            Some(options) => {
                info!(
                    "mqtt: connecting to {}:{} as {}",
                    options.broker_address().0,
                    options.broker_address().1,
                    client_id
                );
                let (client, eventloop) =
                    AsyncClient::new(options, config.channel_capacity.max(1));
                let (link_tx, link_rx) = mpsc::channel(config.channel_capacity.max(1));
                tokio::spawn(poll_eventloop(
                    eventloop,
                    link_tx,
                    config.reconnect_delay(),
                    cancel.clone(),
                ));
                (Some(client), Some(link_rx))
            }
            None => {
                warn!("mqtt: host or port missing, running without broker connection");
                (None, None)
            }
        };

        let session = Session::new(config, client_id, client);
        Self::spawn_with_session(session, link_rx, config.channel_capacity, cancel)
    }

    /// Starts the worker on an existing session and event source.
    ///
    /// `link_rx` is `None` when there is no broker connection to listen to.
    pub fn spawn_with_session<T: MqttTransport + 'static>(
        session: Session<T>,
        link_rx: Option<mpsc::Receiver<LinkEvent>>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (connected_tx, connected_rx) = watch::channel(false);
        let basetopic = session.basetopic().to_string();
        let client_id = session.client_id().to_string();

        let has_client = link_rx.is_some();
        // a receiver whose sender is already gone yields None right away
        let link_rx = link_rx.unwrap_or_else(|| mpsc::channel(1).1);
        tokio::spawn(run_worker(session, rx, link_rx, connected_tx, cancel.clone()));

        Self {
            tx,
            connected: connected_rx,
            basetopic,
            client_id,
            has_client,
            cancel,
        }
    }

    pub fn basetopic(&self) -> &str {
        &self.basetopic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// False once the worker has stopped.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Whether a broker connection was configured at all.
    pub fn has_client(&self) -> bool {
        self.has_client
    }

    /// Resolves once the wrapper is connected; returns false if the worker stopped first.
    pub async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.clone();
        let reached = connected.wait_for(|c| *c).await.is_ok();
        reached
    }

    pub fn resolve_topic(&self, template: &str) -> String {
        apply_basetopic(template, &self.basetopic)
    }

    /// Subscribes `topic` and routes matching messages to `callback`.
    ///
    /// Returns `None` for an empty topic, a topic that is already subscribed
    /// and acknowledged, or when the worker is gone.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        callback: F,
        options: SubscribeOptions,
    ) -> Option<SubscriptionHandle>
    where
        F: Fn(&ArrivedMessage) + Send + Sync + 'static,
    {
        let callback: Callback = std::sync::Arc::new(callback);
        self.subscribe_with(topic, Some(callback), options).await
    }

    pub async fn subscribe_with(
        &self,
        topic: &str,
        callback: Option<Callback>,
        options: SubscribeOptions,
    ) -> Option<SubscriptionHandle> {
        let (response_tx, response_rx) = oneshot::channel();
        let action = MqttAction::Subscribe {
            topic: topic.to_string(),
            callback,
            options,
            response_tx,
        };
        if let Err(e) = self.send(action).await {
            error!("mqtt.subscribe {}: {}", topic, e);
            return None;
        }
        let resolved = response_rx.await.ok().flatten()?;
        Some(SubscriptionHandle {
            topic: resolved,
            handle: self.clone(),
        })
    }

    pub async fn unsubscribe(&self, topic: &str) {
        let action = MqttAction::Unsubscribe {
            topic: topic.to_string(),
        };
        if let Err(e) = self.send(action).await {
            error!("mqtt.unsubscribe {}: {}", topic, e);
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        qos: Option<QoS>,
        retain: bool,
    ) {
        let action = MqttAction::Publish {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
        };
        if let Err(e) = self.send(action).await {
            error!("mqtt.publish {}: {}", topic, e);
        }
    }

    /// Publishes `value` as JSON; values that cannot be encoded go out empty.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        qos: Option<QoS>,
        retain: bool,
    ) {
        self.publish(topic, Payload::json(value), qos, retain).await;
    }

    /// Announces the shutdown, disconnects and stops the worker.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if let Err(e) = self.send(MqttAction::Shutdown { response_tx }).await {
            debug!("mqtt.shutdown: {}", e);
            return;
        }
        let _ = response_rx.await;
    }

    async fn send(&self, action: MqttAction) -> Result<(), MqttError> {
        self.tx
            .send(action)
            .await
            .map_err(|_| MqttError::Channel("mqtt worker stopped".to_string()))
    }
}

fn mqtt_options(config: &MqttConfig, client_id: &str) -> Option<MqttOptions> {
    let (addr, port) = config.broker_addr()?;
    let mut options = MqttOptions::new(client_id, addr, port);
    options
        .set_credentials(config.username.clone(), config.password.clone())
        .set_keep_alive(config.keep_alive());

    if config.transport == TransportKind::Websocket {
        options.set_transport(Transport::Ws);
    }

    if config.status.enabled {
        options.set_last_will(LastWill::new(
            status_topic(&config.basetopic, "status"),
            last_will_payload(&config.status),
            QoS::AtMostOnce,
            false,
        ));
    }
    Some(options)
}

/// Maps a client library event onto the session's view of it.
fn translate(event: Event) -> Option<LinkEvent> {
    match event {
        // refusals surface as `ConnectionError::ConnectionRefused` from `poll`
        Event::Incoming(Incoming::ConnAck(ack))
            if matches!(ack.code, ConnectReturnCode::Success) =>
        {
            Some(LinkEvent::Connected)
        }
        Event::Incoming(Incoming::SubAck(ack)) => Some(LinkEvent::SubscribeAck {
            pkid: ack.pkid,
            accepted: ack
                .return_codes
                .iter()
                .all(|code| !matches!(code, SubscribeReasonCode::Failure)),
        }),
        Event::Incoming(Incoming::UnsubAck(ack)) => Some(LinkEvent::UnsubscribeAck(ack.pkid)),
        Event::Incoming(Incoming::Publish(publish)) => Some(LinkEvent::Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }),
        Event::Incoming(Incoming::Disconnect) => {
            Some(LinkEvent::ConnectionLost("broker sent disconnect".to_string()))
        }
        Event::Outgoing(Outgoing::Subscribe(pkid)) => Some(LinkEvent::SubscribeSent(pkid)),
        _ => None,
    }
}

/// Drives the client library; reconnects happen on the next poll after an error.
///
/// Once `cancel` fires the loop keeps polling until the DISCONNECT is written,
/// the connection fails or [`SHUTDOWN_DRAIN`] has passed, so requests queued
/// by the shutdown still reach the broker.
async fn poll_eventloop(
    mut eventloop: EventLoop,
    link_tx: mpsc::Sender<LinkEvent>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    let mut deadline = None;
    loop {
        let polled = match deadline {
            None => tokio::select! {
                _ = cancel.cancelled() => {
                    deadline = Some(tokio::time::Instant::now() + SHUTDOWN_DRAIN);
                    continue;
                }
                polled = eventloop.poll() => polled,
            },
            Some(deadline) => match tokio::time::timeout_at(deadline, eventloop.poll()).await {
                Ok(polled) => polled,
                Err(_) => {
                    warn!("mqtt: shutdown did not reach the broker in time");
                    break;
                }
            },
        };

        if deadline.is_some() {
            match polled {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => continue,
            }
        }

        let event = match polled {
            Ok(event) => translate(event),
            Err(e) => {
                let lost = LinkEvent::ConnectionLost(MqttError::from(e).to_string());
                if link_tx.send(lost).await.is_err() {
                    break;
                }
                // nothing left to flush while disconnected
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                continue;
            }
        };

        if let Some(event) = event {
            if link_tx.send(event).await.is_err() {
                break;
            }
        }
    }
    debug!("mqtt: event loop stopped");
}

async fn run_worker<T: MqttTransport>(
    mut session: Session<T>,
    mut actions: mpsc::Receiver<MqttAction>,
    mut link_rx: mpsc::Receiver<LinkEvent>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut link_open = true;
    let mut shutdown_ack = None;
    loop {
        tokio::select! {
            // broker events first, so messages already queued are routed
            // before later actions
            biased;

            event = link_rx.recv(), if link_open => {
                match event {
                    Some(event) => session.handle_event(event),
                    None => link_open = false,
                }
            }
            action = actions.recv() => {
                let Some(action) = action else { break };
                match action {
                    MqttAction::Subscribe { topic, callback, options, response_tx } => {
                        let resolved = session.subscribe(&topic, callback, options);
                        let _ = response_tx.send(resolved);
                    }
                    MqttAction::Unsubscribe { topic } => {
                        session.unsubscribe(&topic);
                    }
                    MqttAction::Publish { topic, payload, qos, retain } => {
                        session.publish(&topic, payload, qos, retain);
                    }
                    MqttAction::Shutdown { response_tx } => {
                        shutdown_ack = Some(response_tx);
                        break;
                    }
                }
            }
        }
        connected_tx.send_replace(session.is_connected());
    }

    session.shutdown();
    connected_tx.send_replace(false);
    cancel.cancel();

    // the event loop closes the link once the queued requests are written
    let drained = tokio::time::timeout(SHUTDOWN_DRAIN + Duration::from_secs(1), async {
        while link_rx.recv().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("mqtt: event loop did not stop in time");
    }

    info!("mqtt: worker for {} stopped", session.client_id());
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::session::tests::{RecordingTransport, Request};
    use std::sync::{Arc, Mutex};

    fn start() -> (MqttHandle, mpsc::Sender<LinkEvent>, RecordingTransport) {
        let config = MqttConfig {
            basetopic: "base".into(),
            ..Default::default()
        };
        let transport = RecordingTransport::default();
        let session = Session::new(&config, make_client_id("test"), Some(transport.clone()));
        let (link_tx, link_rx) = mpsc::channel(16);
        let handle =
            MqttHandle::spawn_with_session(session, Some(link_rx), 16, CancellationToken::new());
        (handle, link_tx, transport)
    }

    #[test]
    fn client_id_carries_prefix() {
        let id = make_client_id("ispMQTTid");
        let millis = id.strip_prefix("ispMQTTid_").unwrap();
        assert!(millis.parse::<i64>().unwrap() > 0);
    }

    #[tokio::test]
    async fn subscribe_connect_and_dispatch() {
        let (handle, link_tx, transport) = start();
        assert!(handle.has_client());
        assert!(!handle.is_connected());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = handle
            .subscribe(
                "{basetopic}/cmnd/#",
                move |msg: &ArrivedMessage| sink.lock().unwrap().push(msg.payload.clone()),
                SubscribeOptions::default(),
            )
            .await
            .expect("subscription");
        assert_eq!(sub.topic(), "base/cmnd/#");
        assert!(transport.take().is_empty());

        link_tx.send(LinkEvent::Connected).await.unwrap();
        assert!(handle.wait_connected().await);
        assert_eq!(
            transport.take(),
            vec![Request::Subscribe("base/cmnd/#".into(), QoS::AtMostOnce)]
        );

        link_tx
            .send(LinkEvent::Message {
                topic: "base/cmnd/status".into(),
                payload: br#"{"x":1}"#.to_vec(),
            })
            .await
            .unwrap();
        handle
            .publish_json("{basetopic}/stat/echo", &serde_json::json!({"ok": true}), None, false)
            .await;
        // the publish is handled after the message, so the callback has run
        drop(link_tx);
        handle.shutdown().await;

        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({"x": 1})]);
        let requests = transport.take();
        assert!(matches!(&requests[0], Request::Publish { topic, .. } if topic == "base/stat/echo"));
        assert_eq!(requests.last(), Some(&Request::Disconnect));
    }

    #[tokio::test]
    async fn removal_handle_unsubscribes() {
        let (handle, link_tx, transport) = start();
        link_tx.send(LinkEvent::Connected).await.unwrap();
        assert!(handle.wait_connected().await);

        let sub = handle
            .subscribe_with("sensors/+", None, SubscribeOptions::default())
            .await
            .expect("subscription");
        link_tx.send(LinkEvent::SubscribeSent(1)).await.unwrap();
        link_tx
            .send(LinkEvent::SubscribeAck {
                pkid: 1,
                accepted: true,
            })
            .await
            .unwrap();

        // acknowledged now, so subscribing again is refused
        assert!(handle
            .subscribe_with("sensors/+", None, SubscribeOptions::default())
            .await
            .is_none());

        sub.remove().await;
        drop(link_tx);
        handle.shutdown().await;

        let requests = transport.take();
        assert!(requests.contains(&Request::Unsubscribe("sensors/+".into())));
    }

    #[tokio::test]
    async fn calls_after_shutdown_are_ignored() {
        let (handle, link_tx, _transport) = start();
        drop(link_tx);
        handle.shutdown().await;
        assert!(!handle.is_running());
        assert!(!handle.wait_connected().await);
        assert!(handle
            .subscribe_with("a", None, SubscribeOptions::default())
            .await
            .is_none());
        handle.publish("a", "x", None, false).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_without_endpoint_has_no_client() {
        let handle = MqttHandle::spawn(&MqttConfig::default());
        assert!(!handle.has_client());
        assert!(handle.client_id().starts_with("ispMQTTid_"));
        assert_eq!(handle.resolve_topic("{basetopic}/x"), "ispMQTT/x");
        let sub = handle
            .subscribe_with("{basetopic}/x", None, SubscribeOptions::default())
            .await;
        assert_eq!(sub.map(|s| s.topic().to_string()), Some("ispMQTT/x".to_string()));
        handle.shutdown().await;
    }

    #[test]
    fn translates_connection_events() {
        let connack = rumqttc::ConnAck::new(ConnectReturnCode::Success, false);
        assert_eq!(
            translate(Event::Incoming(Incoming::ConnAck(connack))),
            Some(LinkEvent::Connected)
        );
        assert!(matches!(
            translate(Event::Incoming(Incoming::Disconnect)),
            Some(LinkEvent::ConnectionLost(_))
        ));
        assert_eq!(translate(Event::Incoming(Incoming::PingResp)), None);
        assert_eq!(translate(Event::Outgoing(Outgoing::PingReq)), None);
    }

    #[test]
    fn translates_subscribe_round_trip() {
        assert_eq!(
            translate(Event::Outgoing(Outgoing::Subscribe(4))),
            Some(LinkEvent::SubscribeSent(4))
        );

        let granted = rumqttc::SubAck::new(4, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(
            translate(Event::Incoming(Incoming::SubAck(granted))),
            Some(LinkEvent::SubscribeAck {
                pkid: 4,
                accepted: true
            })
        );

        let refused = rumqttc::SubAck::new(5, vec![SubscribeReasonCode::Failure]);
        assert_eq!(
            translate(Event::Incoming(Incoming::SubAck(refused))),
            Some(LinkEvent::SubscribeAck {
                pkid: 5,
                accepted: false
            })
        );
    }

    #[test]
    fn translates_incoming_publish() {
        let publish = rumqttc::Publish::new("base/cmnd/status", QoS::AtMostOnce, "on");
        assert_eq!(
            translate(Event::Incoming(Incoming::Publish(publish))),
            Some(LinkEvent::Message {
                topic: "base/cmnd/status".into(),
                payload: b"on".to_vec(),
            })
        );
    }

    /// Minimal broker: accepts one client, acknowledges CONNECT and returns
    /// every byte received afterwards until the client hangs up.
    async fn loopback_broker(listener: tokio::net::TcpListener) -> Vec<u8> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x10, "expected CONNECT, got {:?}", &buf[..n]);
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut received = Vec::new();
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[tokio::test]
    async fn shutdown_reaches_broker_before_stopping() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(loopback_broker(listener));

        let config = MqttConfig {
            host: Some("127.0.0.1".into()),
            port: Some(port),
            transport: TransportKind::Tcp,
            basetopic: "base".into(),
            status: crate::mqtt::config::StatusConfig {
                enabled: true,
                name: "lab".into(),
            },
            ..Default::default()
        };
        let handle = MqttHandle::spawn(&config);
        assert!(handle.wait_connected().await);
        handle.shutdown().await;

        let received = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .expect("client closed the connection")
            .unwrap();
        assert!(contains(&received, b"base/stat/status"));
        assert!(contains(&received, br#"base/stat/connected{"mode":"stopped","name":"lab"}"#));
        // DISCONNECT is the last packet on the wire
        assert!(received.ends_with(&[0xe0, 0x00]));
    }
}
