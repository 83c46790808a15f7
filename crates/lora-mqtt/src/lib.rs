// # MQTT Transport
//
// This crate provides the MQTT implementation of the `Transport` trait
// used by broker bindings to reach LoRaWAN application servers.
//
// ## Session Model
//
// Each `connect` call builds a fresh `rumqttc` client and spawns one
// forwarder task that polls the client's event loop and turns it into
// `TransportEvent`s:
//
// - `ConnAck(Success)` → `Connected`
// - `Publish` → `Message`
// - `ConnAck(refused)`, event-loop error or an outgoing disconnect →
//   `Disconnected`, after which the forwarder stops polling
//
// Polling stops on the first error, so `rumqttc`'s built-in reconnect is
// never used. Reconnects belong to the broker binding, which opens a new
// session and replays its subscriptions.
//
// The forwarder also stops once the binding drops the event stream.
//
// ## Schemes
//
// - `mqtt`, `tcp`: plain TCP
// - `mqtts`, `ssl`, `tls`: TLS with the platform's root certificates
// - `ws`, `wss`: rejected; websocket support is not compiled in

use std::sync::Arc;

use async_trait::async_trait;
use lora_core::traits::{
    ConnectOptions, Transport, TransportConnection, TransportEvent, TransportHandle,
};
use lora_core::{Error, Result};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 100;

/// Events buffered between the forwarder and the binding
const EVENT_CAPACITY: usize = 256;

/// MQTT transport backed by `rumqttc`
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Translate connection parameters into client options
pub fn mqtt_options(options: &ConnectOptions) -> Result<MqttOptions> {
    if options.host.is_empty() {
        return Err(Error::config("broker host is empty"));
    }

    let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_clean_session(true);

    if let Some(username) = options.username.as_deref().filter(|u| !u.is_empty()) {
        mqtt.set_credentials(username, options.password.as_deref().unwrap_or_default());
    }

    match options.scheme.to_ascii_lowercase().as_str() {
        "mqtt" | "tcp" => {}
        "mqtts" | "ssl" | "tls" => {
            mqtt.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        "ws" | "wss" => {
            return Err(Error::transport(format!(
                "websocket transport is not supported: {}",
                options.scheme
            )));
        }
        other => {
            return Err(Error::transport(format!("unknown transport scheme: {other}")));
        }
    }

    Ok(mqtt)
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<TransportConnection> {
        let mqtt = mqtt_options(options)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        let host = options.host.clone();
        debug!(host = %host, port = options.port, scheme = %options.scheme, "opening MQTT session");

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = eventloop.poll() => event,
                };

                let forwarded = match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            TransportEvent::Connected
                        } else {
                            let _ = tx
                                .send(TransportEvent::Disconnected(format!(
                                    "connection refused: {:?}",
                                    ack.code
                                )))
                                .await;
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    },
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        let _ = tx
                            .send(TransportEvent::Disconnected("disconnect requested".to_string()))
                            .await;
                        break;
                    }
                    Ok(other) => {
                        trace!(host = %host, event = ?other, "MQTT event");
                        continue;
                    }
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Disconnected(e.to_string())).await;
                        break;
                    }
                };

                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
            debug!(host = %host, "MQTT session closed");
        });

        Ok(TransportConnection {
            handle: Arc::new(MqttHandle { client }),
            events: Box::pin(ReceiverStream::new(rx)),
        })
    }
}

/// Control half of one MQTT session
struct MqttHandle {
    client: AsyncClient,
}

#[async_trait]
impl TransportHandle for MqttHandle {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::transport(format!("subscribe to {topic} failed: {e}")))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| Error::transport(format!("unsubscribe from {topic} failed: {e}")))
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::transport(format!("disconnect failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(scheme: &str) -> ConnectOptions {
        ConnectOptions {
            host: "eu.thethings.network".to_string(),
            port: 1883,
            scheme: scheme.to_string(),
            username: Some("ari_ioe_app_demo1".to_string()),
            password: Some("pwd1".to_string()),
            client_id: "lora-agent-70b3d57ed000985f".to_string(),
            keep_alive: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_plain_options() {
        let mqtt = mqtt_options(&options("mqtt")).unwrap();
        assert_eq!(
            mqtt.broker_address(),
            ("eu.thethings.network".to_string(), 1883)
        );
        assert_eq!(mqtt.client_id(), "lora-agent-70b3d57ed000985f");
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(30));
        assert!(mqtt.clean_session());
    }

    #[test]
    fn test_tls_schemes_accepted() {
        for scheme in ["mqtts", "ssl", "TLS"] {
            assert!(mqtt_options(&options(scheme)).is_ok(), "{scheme}");
        }
    }

    #[test]
    fn test_unsupported_schemes_rejected() {
        for scheme in ["ws", "wss", "amqp"] {
            let err = mqtt_options(&options(scheme)).unwrap_err();
            assert!(matches!(err, Error::Transport(_)), "{scheme}");
        }
    }

    #[test]
    fn test_empty_host_rejected() {
        let mut opts = options("mqtt");
        opts.host.clear();
        assert!(mqtt_options(&opts).is_err());
    }

    #[tokio::test]
    async fn test_connect_returns_session_without_blocking() {
        // Nothing listens on this port; the failure arrives as an event
        let mut opts = options("mqtt");
        opts.host = "127.0.0.1".to_string();
        opts.port = 1;

        let connection = MqttTransport::new().connect(&opts).await.unwrap();
        let mut events = connection.events;

        let event = tokio::time::timeout(
            Duration::from_secs(5),
            tokio_stream::StreamExt::next(&mut events),
        )
        .await
        .unwrap();
        assert!(matches!(event, Some(TransportEvent::Disconnected(_))));
    }
}
