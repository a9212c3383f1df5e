use super::manager;
use crate::{camera::Presence, config::Config, events::PipelineEvent};
use rumqttc::{AsyncClient, Incoming, MqttOptions, Outgoing, QoS};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use std::time::Duration;

const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// Channels into and out of the MQTT tasks
pub struct MqttLink {
    pub events: mpsc::Sender<PipelineEvent>,
    /// Camera announcements and heartbeats from the subscribed topics
    pub presence: mpsc::Receiver<Presence>,
    pub shutdown: MqttShutdown,
}

pub struct MqttShutdown {
    signal: oneshot::Sender<()>,
    eventloop: JoinHandle<()>,
}

impl MqttShutdown {
    /// Flushes queued events, disconnects and waits for the event loop to wind down
    pub async fn run(self, timeout: Duration) {
        let _ = self.signal.send(());
        if tokio::time::timeout(timeout, self.eventloop).await.is_err() {
            warn!("MQTT disconnect timed out");
        }
    }
}

pub fn client_id(prefix: &str) -> String {
    let id = Uuid::new_v4().to_simple().to_string();
    format!("{}_{}", prefix, &id[..8])
}

pub fn initiate_connection(config: &Config) -> MqttLink {
    let (event_tx, mut event_rx) = mpsc::channel::<PipelineEvent>(64);
    let (presence_tx, presence_rx) = mpsc::channel::<Presence>(20);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let mut manager = manager::Manager::new(
        manager::MqttTopics::new(&config.mqtt.topics),
        config.alerts.source.clone(),
    );

    let client_id = client_id(&config.mqtt.client_prefix);
    info!(client_id=%client_id, address=%config.mqtt.address, port=config.mqtt.port, "Connecting to MQTT broker");
    let mut mqttoptions =
        MqttOptions::new(client_id, config.mqtt.address.clone(), config.mqtt.port);
    mqttoptions
        .set_keep_alive(Duration::from_secs(5))
        .set_pending_throttle(Duration::from_millis(10));
    if !config.mqtt.username.is_empty() {
        mqttoptions.set_credentials(config.mqtt.username.clone(), config.mqtt.password.clone());
    }
    // Subscriptions are renewed on every ConnAck
    mqttoptions.set_clean_session(true);
    mqttoptions.set_last_will(manager.mqtt_lwt().into());

    let (connection_notify_tx, mut connection_notify_rx) = mpsc::unbounded_channel::<()>();
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Launch the event loop as a task
    let eventloop = tokio::task::spawn(
        async move {
            loop {
                let event = eventloop.poll().await;
                match event {
                    Ok(event) => match event {
                        rumqttc::Event::Incoming(Incoming::Publish(publish)) => {
                            let _ = incoming_tx.send((publish.topic, publish.payload.to_vec()));
                        }
                        rumqttc::Event::Incoming(Incoming::ConnAck(_)) => {
                            info!("Connected to MQTT broker.");
                            let _ = connection_notify_tx.send(());
                        }
                        rumqttc::Event::Outgoing(Outgoing::Disconnect) => {
                            debug!("Disconnected from MQTT broker");
                            break;
                        }
                        _ => {}
                    },
                    Err(e) => {
                        error!("MQTT Connection error encountered: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        .instrument(info_span!("MqttEventLoop")),
    );

    // Launch the client as a task
    tokio::task::spawn(
        async move {
            loop {
                let messages = tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(event) => manager.next_event(event, chrono::Utc::now()),
                        None => break,
                    },

                    _ = connection_notify_rx.recv() => {
                        for topic in manager.subscriptions() {
                            if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                error!(topic=%topic, "Unable to subscribe: {}", e);
                            }
                        }
                        manager.mqtt_connection_established(chrono::Utc::now())
                    }

                    Some((topic, payload)) = incoming_rx.recv() => {
                        if let Some(presence) = manager.incoming(&topic, &payload) {
                            forward_presence(&presence_tx, presence);
                        }
                        Vec::new()
                    }

                    _ = &mut shutdown_rx => {
                        let mut messages = Vec::new();
                        while let Ok(event) = event_rx.try_recv() {
                            messages.append(&mut manager.next_event(event, chrono::Utc::now()));
                        }
                        if !flush_and_disconnect(&client, messages, SHUTDOWN_FLUSH).await {
                            warn!("Timed out flushing MQTT messages before disconnect");
                        }
                        break;
                    }
                };
                publish_all(&client, messages);
            }
        }
        .instrument(info_span!("MqttClient")),
    );

    MqttLink {
        events: event_tx,
        presence: presence_rx,
        shutdown: MqttShutdown {
            signal: shutdown_tx,
            eventloop,
        },
    }
}

/// Hands presence to the supervisor without waiting on it. Dropped when the supervisor is behind.
fn forward_presence(tx: &mpsc::Sender<Presence>, presence: Presence) {
    match tx.try_send(presence) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(p)) => warn!(presence=?p, "Presence queue full, dropping"),
        Err(mpsc::error::TrySendError::Closed(_)) => debug!("Presence receiver dropped"),
    }
}

/// Publishes the remaining messages and disconnects, waiting for room in the request buffer.
/// Returns false when `deadline` passed first.
async fn flush_and_disconnect(
    client: &AsyncClient,
    messages: Vec<manager::MqttMessage>,
    deadline: Duration,
) -> bool {
    let flush = async {
        for message in messages {
            if let Err(e) = client
                .publish(
                    message.topic,
                    message.qos.into(),
                    message.retain,
                    message.payload.render(),
                )
                .await
            {
                error!("Unable to publish MQTT message: {}", e);
            }
        }
        if let Err(e) = client.disconnect().await {
            error!("Unable to disconnect cleanly: {}", e);
        }
    };
    tokio::time::timeout(deadline, flush).await.is_ok()
}

/// Queues messages without waiting. Messages are dropped while the request buffer is full.
fn publish_all(client: &AsyncClient, messages: Vec<manager::MqttMessage>) {
    for message in messages {
        if let Err(e) = client.try_publish(
            message.topic,
            message.qos.into(),
            message.retain,
            message.payload.render(),
        ) {
            error!("Unable to publish MQTT message: {}", e);
        }
    }
}
