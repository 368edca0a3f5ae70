/// MQTT publishing: broker connection, Home Assistant discovery
/// and the reconnecting publish session.
pub mod connection;
pub mod discovery;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use futures_util::future::BoxFuture;
use rumqttc::{ClientError, ConnectionError};
use thiserror::Error;

pub use connection::{BrokerOptions, MqttConnection};
pub use discovery::Topics;
pub use session::{ConnectionState, PublishSession, PublishSummary};

/// Error type for publish transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("MQTT request rejected: {0}")]
    Client(#[from] ClientError),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("not connected")]
    NotConnected,
    #[error("message of {size} bytes exceeds the {limit} byte packet limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Minimal publish transport so the session does not depend on a socket
pub trait Transport: Send {
    /// One bounded connection attempt
    fn connect(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn is_connected(&self) -> bool;

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: &'a [u8],
        retain: bool,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Keep-alive and inbound traffic; never waits on the network
    fn service(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn disconnect(&mut self) -> BoxFuture<'_, ()>;
}
