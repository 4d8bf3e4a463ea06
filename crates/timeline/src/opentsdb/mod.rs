use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{Backend, ConfigError, TransportConfig};
use crate::point::{self, ConversionError, FlatOperation, FlattenedPoint};
use crate::transport::{TransferError, Transport, TransportKind};

/// One `put` line: `put <metric> <timestamp> <value> <k=v>...`.
///
/// OpenTSDB treats tags as a set keyed by name, so they are held sorted and
/// unique. Lines are written in key order.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTsdbPoint {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
}

impl OpenTsdbPoint {
    /// Checks that the point encodes to exactly one well-formed `put` line.
    pub fn validate(&self) -> Result<(), ConversionError> {
        point::check_metric(&self.metric, self.value)?;
        if self.metric.contains(char::is_whitespace) {
            return Err(ConversionError::InvalidMetric(self.metric.clone()));
        }
        for (k, v) in &self.tags {
            if !valid_tag_part(k) || !valid_tag_part(v) {
                return Err(ConversionError::InvalidTag {
                    key: k.clone(),
                    value: v.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Writes batches to OpenTSDB's telnet-style line protocol, one connection
/// per batch.
pub struct OpenTsdbTransport {
    address: Option<(String, u16)>,
    request_timeout: Duration,
    serializer_buffer_size: usize,
}

impl OpenTsdbTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            address: None,
            request_timeout: config.request_timeout,
            serializer_buffer_size: config.serializer_buffer_size,
        }
    }

    fn encode(&self, batch: &[OpenTsdbPoint]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.serializer_buffer_size);
        for point in batch {
            // BytesMut grows on demand; fmt::Write on it cannot fail.
            let _ = write!(buf, "put {} {} {}", point.metric, point.timestamp, point.value);
            for (k, v) in &point.tags {
                let _ = write!(buf, " {k}={v}");
            }
            buf.extend_from_slice(b"\n");
        }
        buf
    }
}

impl Transport for OpenTsdbTransport {
    type Item = OpenTsdbPoint;

    fn configure(&mut self, backend: &Backend) -> Result<(), ConfigError> {
        backend.validate()?;
        debug!(host = %backend.host, port = backend.port, "opentsdb transport configured");
        self.address = Some((backend.host.clone(), backend.port));
        Ok(())
    }

    async fn transfer(&self, batch: Vec<OpenTsdbPoint>) -> Result<(), TransferError> {
        let (host, port) = self.address.as_ref().ok_or(TransferError::NotConfigured)?;
        for item in &batch {
            item.validate()?;
        }
        let payload = self.encode(&batch);

        let send = async {
            let mut stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.write_all(&payload).await?;
            stream.shutdown().await
        };

        tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| TransferError::Timeout(self.request_timeout))??;
        Ok(())
    }

    fn to_flattened_point(
        &self,
        operation: FlatOperation,
        item: &OpenTsdbPoint,
    ) -> Result<FlattenedPoint, ConversionError> {
        item.validate()?;
        Ok(FlattenedPoint {
            operation,
            metric: item.metric.clone(),
            tags: item.tags.clone(),
            timestamp: item.timestamp,
            value: item.value,
        })
    }

    fn from_flattened_point(
        &self,
        point: &FlattenedPoint,
    ) -> Result<OpenTsdbPoint, ConversionError> {
        let item = OpenTsdbPoint {
            metric: point.metric.clone(),
            timestamp: point.timestamp,
            value: point.value,
            tags: point.tags.clone(),
        };
        item.validate()?;
        Ok(item)
    }

    fn matches(&self, kind: TransportKind) -> bool {
        kind == TransportKind::OpenTsdb
    }
}

/// Tag keys and values are space-separated `k=v` pairs on the wire.
fn valid_tag_part(s: &str) -> bool {
    !s.is_empty() && !s.contains(|c: char| c.is_whitespace() || c == '=')
}
