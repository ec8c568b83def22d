//! Error types of the MQTT wrapper

use thiserror::Error;

/// Errors raised while talking to the client library.
///
/// None of these reach the caller of the wrapper API; they are logged where
/// they occur.
#[derive(Debug, Error)]
pub enum MqttError {
    /// The client library refused a request (request channel full or closed)
    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The event loop lost or could not establish the connection
    #[error("Connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    /// The worker task is gone
    #[error("Channel error: {0}")]
    Channel(String),

    /// Payload could not be encoded
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}
