//! HTTP delivery of metric envelopes to the collector.

use core::future::Future;
use std::io::Write;

use error_stack::bail;
use error_stack::Report;
use error_stack::ResultExt;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics_types::sign::Signer;
use metrics_types::sign::HASH_HEADER;
use reqwest::header::CONTENT_ENCODING;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;
use tracing::info;

use crate::config::AgentConfig;
use crate::dispatcher::Payload;
use crate::error::TransportError;

/// Delivers one payload to the collector. One call is one attempt; retrying is the
/// dispatcher's job.
pub trait Transport: Send + Sync + 'static {
    fn deliver(
        &self,
        payload: &Payload,
    ) -> impl Future<Output = Result<(), Report<TransportError>>> + Send;
}

/// JSON over HTTP, gzip-compressed, optionally signed.
pub struct HttpTransport {
    http: Client,
    server_url: String,
    signer: Signer,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig) -> Result<Self, Report<TransportError>> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .change_context(TransportError::Configuration {
                message: "Failed to create HTTP client".into(),
            })?;

        info!(server_url = %config.server_url, signed = config.key.is_some(), "HTTP transport created");

        Ok(Self {
            http,
            server_url: config.server_url.clone(),
            signer: Signer::new(config.key.as_deref()),
        })
    }

    fn url(&self, payload: &Payload) -> String {
        match payload {
            Payload::Single(_) => format!("{}/update/", self.server_url),
            Payload::Batch(_) => format!("{}/updates/", self.server_url),
        }
    }
}

/// JSON body of a payload: an object for a single envelope, an array for a batch.
pub fn encode_body(payload: &Payload) -> Result<Vec<u8>, Report<TransportError>> {
    let encoded = match payload {
        Payload::Single(metric) => serde_json::to_vec(metric),
        Payload::Batch(batch) => serde_json::to_vec(batch),
    };
    encoded.change_context(TransportError::Serialization {
        message: "Failed to encode metrics".into(),
    })
}

pub fn gzip(body: &[u8]) -> Result<Vec<u8>, Report<TransportError>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    let gzip_failed = || TransportError::Serialization {
        message: "Failed to gzip body".into(),
    };
    encoder.write_all(body).change_context_lazy(gzip_failed)?;
    encoder.finish().change_context_lazy(gzip_failed)
}

impl Transport for HttpTransport {
    async fn deliver(&self, payload: &Payload) -> Result<(), Report<TransportError>> {
        let body = encode_body(payload)?;
        // signed over the JSON bytes, before compression
        let digest = self.signer.sign(&body);
        let compressed = gzip(&body)?;

        let url = self.url(payload);
        let mut request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(compressed);
        if let Some(digest) = digest {
            request = request.header(HASH_HEADER, digest);
        }

        let response = request
            .send()
            .await
            .change_context(TransportError::Network {
                message: format!("Failed to reach {url}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            bail!(TransportError::Http {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        debug!(url = %url, metrics = payload.len(), "payload delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use metrics_types::Metrics;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn single_and_batch_bodies_differ_in_shape() {
        let single = encode_body(&Payload::Single(Metrics::counter("PollCount", 1)))
            .expect("encode single");
        let batch = encode_body(&Payload::Batch(vec![Metrics::gauge("Alloc", 2.5)]))
            .expect("encode batch");

        assert_eq!(
            String::from_utf8(single).expect("utf8"),
            r#"{"id":"PollCount","type":"counter","delta":1}"#
        );
        assert_eq!(
            String::from_utf8(batch).expect("utf8"),
            r#"[{"id":"Alloc","type":"gauge","value":2.5}]"#
        );
    }

    #[test]
    fn gzip_round_trips() {
        let body = br#"[{"id":"Alloc","type":"gauge","value":2.5}]"#;
        let compressed = gzip(body).expect("gzip");

        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .expect("gunzip");
        assert_eq!(decoded, body.to_vec());
    }

    #[test]
    fn urls_follow_payload_shape() {
        let transport =
            HttpTransport::new(&AgentConfig::new("localhost:8080")).expect("client builds");
        assert_eq!(
            transport.url(&Payload::Single(Metrics::gauge("a", 1.0))),
            "http://localhost:8080/update/"
        );
        assert_eq!(
            transport.url(&Payload::Batch(Vec::new())),
            "http://localhost:8080/updates/"
        );
    }
}
