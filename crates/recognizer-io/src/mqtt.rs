//! MQTT notifier.
//!
//! One persistent client per process. `rumqttc` needs its event loop polled
//! for anything to go out, so a background task drives it until disconnect.
//! Publishing never waits on the broker: while the connection is down the
//! notifier reports itself unavailable instead of queueing.

use crate::config::MqttConnection;
use async_trait::async_trait;
use recognizer_core::{Notifier, NotifyError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 16;

/// How long callers wait for the first connection before carrying on.
pub const CONNECT_WAIT: Duration = Duration::from_secs(5);
/// How long `shutdown` lets the event loop flush a disconnect.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub struct MqttNotifier {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    /// Create the client and start its event loop. The connection itself is
    /// established, and re-established, in the background.
    pub fn connect(connection: &MqttConnection) -> Self {
        let (client, event_loop) = AsyncClient::new(options(connection), REQUEST_CAPACITY);
        let broker = format!("{}:{}", connection.broker, connection.port);
        tracing::info!(broker = %broker, client_id = %connection.client_id, "starting MQTT client");

        let (state, connected) = watch::channel(false);
        Self {
            client,
            connected,
            event_loop: Mutex::new(Some(tokio::spawn(drive(event_loop, broker, state)))),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait up to `timeout` for the broker to acknowledge the connection.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.clone();
        let up = matches!(
            tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        up
    }

    /// Request a clean disconnect and wait up to `grace` for the event loop
    /// to flush it. A loop still running after that is aborted.
    pub async fn shutdown(&self, grace: Duration) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::warn!(error = %e, "MQTT disconnect failed");
        }
        let handle = match self.event_loop.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!(grace = ?grace, "MQTT event loop did not stop in time, aborting");
            handle.abort();
        }
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        let handle = match self.event_loop.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Notifier for MqttNotifier {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), NotifyError> {
        if !self.is_connected() {
            return Err(NotifyError::Unavailable(
                "not connected to MQTT broker".to_string(),
            ));
        }
        // try_publish only fails when the request channel is full, which
        // means the event loop is not draining it.
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| NotifyError::Unavailable(e.to_string()))
    }
}

fn options(connection: &MqttConnection) -> MqttOptions {
    let mut options = MqttOptions::new(
        connection.client_id.clone(),
        connection.broker.clone(),
        connection.port,
    );
    options.set_credentials(connection.username.clone(), connection.password.clone());
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    options
}

async fn drive(mut event_loop: EventLoop, broker: String, connected: watch::Sender<bool>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(broker = %broker, "connected to MQTT broker");
                connected.send_replace(true);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!(broker = %broker, "disconnected from MQTT broker");
                connected.send_replace(false);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                connected.send_replace(false);
                tracing::warn!(broker = %broker, error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Notifier used when no broker is configured. Discovery mode never publishes,
/// so this only ever logs.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), NotifyError> {
        tracing::debug!(topic, payload, "no broker configured, dropping notification");
        Ok(())
    }
}
