//! `rumqttc`-backed `BrokerClient` adapter for Source A (spec §4.2, §6).

use domain::Qos as DomainQos;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS as MqttQos};
use source_a::{BrokerClient, BrokerError, BrokerMessage};
use std::time::Duration;
use tokio::sync::mpsc;

fn to_mqtt_qos(qos: DomainQos) -> MqttQos {
    match qos {
        DomainQos::AtMostOnce => MqttQos::AtMostOnce,
        DomainQos::AtLeastOnce => MqttQos::AtLeastOnce,
        DomainQos::ExactlyOnce => MqttQos::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: MqttQos) -> DomainQos {
    match qos {
        MqttQos::AtMostOnce => DomainQos::AtMostOnce,
        MqttQos::AtLeastOnce => DomainQos::AtLeastOnce,
        MqttQos::ExactlyOnce => DomainQos::ExactlyOnce,
    }
}

/// `BrokerClient` adapter over `rumqttc`. Each `connect()` spawns a fresh
/// event-loop-polling task that forwards `Publish` packets to an internal
/// channel; `next_message` reads off that channel, decoupling the
/// subscriber's pull-based contract from `rumqttc`'s push-based event loop.
pub struct MqttBroker {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    keepalive: Duration,
    client_id: String,
    client: Option<AsyncClient>,
    inbox: Option<mpsc::Receiver<BrokerMessage>>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for MqttBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBroker").field("host", &self.host).field("port", &self.port).finish_non_exhaustive()
    }
}

impl MqttBroker {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        keepalive: Duration,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username,
            password,
            keepalive,
            client_id: client_id.into(),
            client: None,
            inbox: None,
            poll_task: None,
        }
    }
}

impl BrokerClient for MqttBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 256);
        let (tx, rx) = mpsc::channel(1024);

        let poll_task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        let message = BrokerMessage {
                            topic: publish.topic,
                            payload,
                            qos: from_mqtt_qos(publish.qos),
                            retained: publish.retain,
                        };
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("mqtt.event_loop.error: {err}");
                        return;
                    }
                }
            }
        });

        self.client = Some(client);
        self.inbox = Some(rx);
        self.poll_task = Some(poll_task);
        Ok(())
    }

    async fn subscribe(&mut self, pattern: &str, qos: DomainQos) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or_else(|| BrokerError::Connection("not connected".to_owned()))?;
        client.subscribe(pattern, to_mqtt_qos(qos)).await.map_err(|err| BrokerError::Subscribe(err.to_string()))
    }

    async fn next_message(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
        let Some(inbox) = self.inbox.as_mut() else {
            return Err(BrokerError::Connection("not connected".to_owned()));
        };
        Ok(inbox.recv().await)
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.inbox = None;
    }
}
