use std::collections::BTreeMap;
use std::io::Write;

use flate2::write::GzEncoder;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::{Backend, ConfigError, TransportConfig};
use crate::point::{self, ConversionError, FlatOperation, FlattenedPoint};
use crate::transport::{TransferError, Transport, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    Gzip,
    None,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Joined onto `http://{host}:{port}` once the backend is configured.
    pub path: String,
    pub compression: Compression,
    pub headers: Vec<(String, String)>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            path: "/api/put".to_owned(),
            compression: Compression::None,
            headers: Vec::new(),
        }
    }
}

/// One point as the HTTP backend receives it: an element of a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPoint {
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub timestamp: i64,
    pub value: f64,
}

/// Posts each batch as a JSON array.
pub struct HttpTransport {
    client: Client,
    endpoint: Option<Url>,
    settings: HttpSettings,
    serializer_buffer_size: usize,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig, settings: HttpSettings) -> Result<Self, ConfigError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            endpoint: None,
            settings,
            serializer_buffer_size: config.serializer_buffer_size,
        })
    }

    fn serialize(&self, batch: &[HttpPoint]) -> Result<Vec<u8>, TransferError> {
        let mut body = Vec::with_capacity(self.serializer_buffer_size);
        serde_json::to_writer(&mut body, batch)?;

        match self.settings.compression {
            Compression::Gzip => Ok(compress_gzip(&body)?),
            Compression::None => Ok(body),
        }
    }
}

impl Transport for HttpTransport {
    type Item = HttpPoint;

    fn configure(&mut self, backend: &Backend) -> Result<(), ConfigError> {
        backend.validate()?;

        let base = format!("http://{}:{}", backend.host, backend.port);
        let endpoint = Url::parse(&base)
            .and_then(|url| url.join(&self.settings.path))
            .map_err(|_| ConfigError::InvalidUrl(format!("{base}{}", self.settings.path)))?;

        debug!(%endpoint, "http transport configured");
        self.endpoint = Some(endpoint);
        Ok(())
    }

    async fn transfer(&self, batch: Vec<HttpPoint>) -> Result<(), TransferError> {
        let endpoint = self.endpoint.as_ref().ok_or(TransferError::NotConfigured)?;
        let body = self.serialize(&batch)?;

        let mut req = self
            .client
            .post(endpoint.clone())
            .header("content-type", "application/json");

        if self.settings.compression == Compression::Gzip {
            req = req.header("content-encoding", "gzip");
        }

        for (k, v) in &self.settings.headers {
            req = req.header(k, v);
        }

        let resp = req.body(body).send().await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransferError::Rejected {
                status: resp.status(),
            })
        }
    }

    fn to_flattened_point(
        &self,
        operation: FlatOperation,
        item: &HttpPoint,
    ) -> Result<FlattenedPoint, ConversionError> {
        point::check_metric(&item.metric, item.value)?;
        Ok(FlattenedPoint {
            operation,
            metric: item.metric.clone(),
            tags: item.tags.clone(),
            timestamp: item.timestamp,
            value: item.value,
        })
    }

    fn from_flattened_point(&self, point: &FlattenedPoint) -> Result<HttpPoint, ConversionError> {
        point.validate()?;
        Ok(HttpPoint {
            metric: point.metric.clone(),
            tags: point.tags.clone(),
            timestamp: point.timestamp,
            value: point.value,
        })
    }

    fn matches(&self, kind: TransportKind) -> bool {
        kind == TransportKind::Http
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}
