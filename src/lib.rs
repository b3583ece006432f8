/*!
This crate provides an asynchronous client for communicating with a message
broker using the MQTT5 protocol.

The heart of the crate is the session engine: a single-task state machine
that multiplexes user operations onto one broker connection, assigns and
recycles packet identifiers, drives the QoS 1 and QoS 2 delivery handshakes,
persists in-flight work across reconnects through a pluggable session store,
paces transmission against the broker's receive maximum, and owns keep-alive
and automatic reconnection policy.  QoS 1 deliveries survive connection loss;
QoS 2 deliveries additionally survive process restarts when backed by a
durable [`persist::Persistence`] implementation.

# Usage

To use this crate, add it to your project's Cargo.toml:

```toml
[dependencies]
bobbin-mqtt = "0.3"
```

If your project does not already include [`tokio`](https://crates.io/crates/tokio),
you will need that too.

# Example: connect, subscribe, publish

```no_run
use bobbin_mqtt::client::MqttClientBuilder;
use bobbin_mqtt::config::{ConnectOptionsBuilder};
use bobbin_mqtt::mqtt::{PublishPacket, QualityOfService, SubscribePacket, Subscription};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let connect_options = ConnectOptionsBuilder::new()
        .with_client_id("sensor-hub-4")
        .with_session_expiry_interval_seconds(3600)
        .build();

    let client = MqttClientBuilder::new("tcp://127.0.0.1:1883")
        .with_connect_options(connect_options)
        .build(None)?;

    client.connect().await?;

    client.subscribe(SubscribePacket {
        subscriptions: vec![Subscription {
            topic_filter: "telemetry/#".to_string(),
            qos: QualityOfService::AtLeastOnce,
            ..Default::default()
        }],
        ..Default::default()
    }).await?;

    client.publish(PublishPacket {
        topic: "telemetry/online".to_string(),
        qos: QualityOfService::AtLeastOnce,
        payload: b"hello".to_vec(),
        ..Default::default()
    }).await?;

    Ok(())
}
```

Connections ride plain TCP (`tcp://`), TLS (`ssl://`), or websockets
(`ws://`, `wss://`, subprotocol `mqtt` at path `/mqtt`); configured server
URIs are tried in order on every connection attempt.
*/

#![warn(missing_docs)]

mod alias;
pub mod client;
pub mod config;
mod connection;
mod decode;
mod encode;
mod engine;
pub mod mqtt;
pub mod persist;
mod queue;
mod session;
mod token;
mod transport;

pub mod error;

pub use client::{MqttClient, MqttClientBuilder, ClientEvent, ClientEventListener};
pub use config::{ClientOptionsBuilder, ConnectOptionsBuilder};
pub use connection::NegotiatedSettings;
pub use error::{MqttError, MqttResult};
pub use mqtt::{MqttPacket, PacketType, PublishPacket, QualityOfService, Subscription};
pub use queue::QueueFullPolicy;
pub use session::MessageListener;
pub use token::{TokenResult, TokenState};
pub use transport::{ServerUri, UriScheme};
