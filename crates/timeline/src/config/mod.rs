use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid transport buffer size: {0}")]
    InvalidBufferSize(usize),

    #[error("invalid serializer buffer size: {0}")]
    InvalidSerializerBufferSize(usize),

    #[error("invalid batch send interval: {0:?}")]
    InvalidBatchSendInterval(Duration),

    #[error("invalid request timeout: {0:?}")]
    InvalidRequestTimeout(Duration),

    #[error("backend host is empty")]
    EmptyHost,

    #[error("invalid backend port: {0}")]
    InvalidPort(u16),

    #[error("backend address is not a valid URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Address of the backend a transport delivers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        Ok(())
    }
}

/// Settings shared by the batcher and every transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of the input queue. `None` means unbounded.
    pub transport_buffer_size: Option<usize>,
    pub batch_send_interval: Duration,
    /// Handed to the transport; the batcher never enforces it.
    pub request_timeout: Duration,
    /// Initial capacity of the transport's encode buffer.
    pub serializer_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport_buffer_size: Some(1024),
            batch_send_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            serializer_buffer_size: 2048,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(size) = self.transport_buffer_size
            && size == 0
        {
            return Err(ConfigError::InvalidBufferSize(size));
        }

        if self.serializer_buffer_size == 0 {
            return Err(ConfigError::InvalidSerializerBufferSize(
                self.serializer_buffer_size,
            ));
        }

        if self.batch_send_interval.is_zero() {
            return Err(ConfigError::InvalidBatchSendInterval(
                self.batch_send_interval,
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidRequestTimeout(self.request_timeout));
        }

        Ok(())
    }
}
