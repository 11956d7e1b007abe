//! HTTP API of the metrics collector.
//!
//! # API Endpoints
//!
//! - `POST /update/{type}/{name}/{value}` - store one metric given in the path
//! - `POST /update/` - store one JSON envelope, answers with the stored state
//! - `POST /updates/` - store a JSON array of envelopes in one batch
//! - `GET /value/{type}/{name}` - raw value of a metric, `404` if unknown
//! - `POST /value/` - envelope of `{"id","type"}`, zero-valued if unknown
//! - `GET /` - every stored metric as a JSON array
//! - `GET /ping` - storage connectivity, `200` or `500`
//!
//! # Request bodies
//!
//! Bodies sent with `Content-Encoding: gzip` are decompressed first. When the
//! server has a key and the request carries a `HashSHA256` header, the header
//! must match the HMAC-SHA256 of the decompressed body.

mod handlers;
mod server;

use std::sync::Arc;

use metrics_types::sign::Signer;
use poem::get;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;

pub use self::server::ApiServer;
use crate::checkpoint::Checkpoint;
use crate::storage::MetricStorage;

/// Shared state of every handler.
pub struct AppState {
    pub storage: Arc<dyn MetricStorage>,
    pub signer: Signer,
    /// Set when every successful write must be checkpointed before answering.
    pub sync_checkpoint: Option<Arc<Checkpoint>>,
}

impl AppState {
    pub fn new(storage: Arc<dyn MetricStorage>) -> Self {
        Self {
            storage,
            signer: Signer::default(),
            sync_checkpoint: None,
        }
    }

    pub fn with_key(mut self, key: Option<&str>) -> Self {
        self.signer = Signer::new(key);
        self
    }

    pub fn with_sync_checkpoint(mut self, checkpoint: Arc<Checkpoint>) -> Self {
        self.sync_checkpoint = Some(checkpoint);
        self
    }
}

/// All routes, wrapped in request tracing.
pub fn routes(state: Arc<AppState>) -> impl Endpoint {
    Route::new()
        .at("/", get(handlers::list_metrics))
        .at("/ping", get(handlers::ping))
        .at("/update/", post(handlers::update_json))
        .at("/updates/", post(handlers::update_batch))
        .at("/update/:kind/:name/:value", post(handlers::update_path))
        .at("/value/", post(handlers::value_json))
        .at("/value/:kind/:name", get(handlers::value_path))
        .data(state)
        .with(Tracing)
}
