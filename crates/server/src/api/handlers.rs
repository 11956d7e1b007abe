use std::io::Read;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use flate2::read::GzDecoder;
use metrics_types::sign::HASH_HEADER;
use metrics_types::MetricKind;
use metrics_types::MetricValue;
use metrics_types::Metrics;
use poem::handler;
use poem::http::header::CONTENT_ENCODING;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::Body;
use poem::Request;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::AppState;
use crate::error::ApiError;
use crate::error::StorageError;
use crate::storage::Record;

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Storage { .. } | ApiError::ServerError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Upper bound of a request body, before and after decompression.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

fn too_large() -> ApiError {
    ApiError::PayloadTooLarge {
        limit: MAX_BODY_BYTES,
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError::BadRequest {
        message: message.into(),
    }
}

/// Converts a failure into a plain-text response. Details stay in the log.
fn reject(report: Report<ApiError>) -> poem::Error {
    let context = report.current_context();
    let status = context.status();
    if status.is_server_error() {
        error!("request failed: {report:?}");
    } else {
        debug!("request rejected: {report:?}");
    }
    poem::Error::from_string(context.to_string(), status)
}

/// Kind mismatches are the client's fault, everything else is ours.
fn storage_failure(report: Report<StorageError>) -> Report<ApiError> {
    let context = match report.current_context() {
        StorageError::KindMismatch { .. } => bad_request(report.current_context().to_string()),
        other => ApiError::Storage {
            message: other.to_string(),
        },
    };
    report.change_context(context)
}

fn parse_kind(raw: &str) -> Result<MetricKind, Report<ApiError>> {
    raw.parse::<MetricKind>()
        .change_context_lazy(|| bad_request(format!("Metric type is not supported: {raw}")))
}

/// Reads the whole body, gunzips it if needed and checks its digest.
async fn read_body(
    req: &Request,
    body: Body,
    state: &AppState,
) -> Result<Vec<u8>, Report<ApiError>> {
    let mut raw = Vec::new();
    body.into_async_read()
        .take(MAX_BODY_BYTES as u64 + 1)
        .read_to_end(&mut raw)
        .await
        .change_context_lazy(|| bad_request("Cannot read request body"))?;
    if raw.len() > MAX_BODY_BYTES {
        return Err(Report::new(too_large()));
    }

    let gzipped = req
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    let body = if gzipped {
        let mut decoded = Vec::new();
        GzDecoder::new(raw.as_slice())
            .take(MAX_BODY_BYTES as u64 + 1)
            .read_to_end(&mut decoded)
            .change_context_lazy(|| bad_request("Body is not valid gzip"))?;
        if decoded.len() > MAX_BODY_BYTES {
            return Err(Report::new(too_large()));
        }
        decoded
    } else {
        raw
    };

    let digest = req.headers().get(HASH_HEADER).and_then(|v| v.to_str().ok());
    state.signer.verify(&body, digest).change_context_lazy(|| {
        warn!(uri = %req.uri(), "rejecting request with bad signature");
        bad_request("Signature does not match body")
    })?;
    Ok(body)
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, Report<ApiError>> {
    serde_json::from_slice(body).change_context_lazy(|| bad_request("Body is not a valid metric"))
}

fn validate(metric: &Metrics) -> Result<Record, Report<ApiError>> {
    Record::from_envelope(metric).change_context_lazy(|| bad_request("Metric is invalid"))
}

/// Writes the checkpoint after a successful write when configured to do so.
async fn checkpoint_after_write(state: &AppState) {
    if let Some(checkpoint) = &state.sync_checkpoint {
        if let Err(err) = checkpoint.flush(state.storage.as_ref()).await {
            error!("synchronous checkpoint failed: {err:?}");
        }
    }
}

#[handler]
pub async fn update_path(
    Path((kind, name, value)): Path<(String, String, String)>,
    Data(state): Data<&Arc<AppState>>,
) -> poem::Result<String> {
    let record = async {
        let kind = parse_kind(&kind)?;
        if name.trim().is_empty() {
            return Err(Report::new(bad_request("Metric id must not be empty")));
        }
        let value = MetricValue::parse(kind, &value)
            .change_context_lazy(|| bad_request(format!("Metric value not supported: {value}")))?;
        state
            .storage
            .update(&Record::new(name.clone(), value))
            .await
            .map_err(storage_failure)
    }
    .await
    .map_err(reject)?;

    checkpoint_after_write(state).await;
    debug!(metric = %record.id, value = %record.value, "metric updated");
    Ok(String::new())
}

#[handler]
pub async fn update_json(
    req: &Request,
    body: Body,
    Data(state): Data<&Arc<AppState>>,
) -> poem::Result<Json<Metrics>> {
    let stored = async {
        let body = read_body(req, body, state).await?;
        let record = validate(&parse_json::<Metrics>(&body)?)?;
        state.storage.update(&record).await.map_err(storage_failure)
    }
    .await
    .map_err(reject)?;

    checkpoint_after_write(state).await;
    Ok(Json(stored.to_envelope()))
}

#[handler]
pub async fn update_batch(
    req: &Request,
    body: Body,
    Data(state): Data<&Arc<AppState>>,
) -> poem::Result<StatusCode> {
    let applied = async {
        let body = read_body(req, body, state).await?;
        let batch = parse_json::<Vec<Metrics>>(&body)?
            .iter()
            .map(validate)
            .collect::<Result<Vec<_>, _>>()?;
        state
            .storage
            .add_batch(&batch)
            .await
            .map_err(storage_failure)?;
        Ok::<_, Report<ApiError>>(batch.len())
    }
    .await
    .map_err(reject)?;

    checkpoint_after_write(state).await;
    debug!(metrics = applied, "batch updated");
    Ok(StatusCode::OK)
}

#[handler]
pub async fn value_path(
    Path((kind, name)): Path<(String, String)>,
    Data(state): Data<&Arc<AppState>>,
) -> poem::Result<String> {
    let value = async {
        let kind = parse_kind(&kind)?;
        let (record, found) = state
            .storage
            .get_metric(&name, kind)
            .await
            .map_err(storage_failure)?;
        if !found {
            return Err(Report::new(ApiError::NotFound {
                kind,
                id: name.clone(),
            }));
        }
        Ok::<_, Report<ApiError>>(record.value)
    }
    .await
    .map_err(reject)?;

    Ok(value.to_string())
}

#[handler]
pub async fn value_json(
    req: &Request,
    body: Body,
    Data(state): Data<&Arc<AppState>>,
) -> poem::Result<Json<Metrics>> {
    let record = async {
        let body = read_body(req, body, state).await?;
        let request = parse_json::<Metrics>(&body)?;
        if request.id.trim().is_empty() {
            return Err(Report::new(bad_request("Metric id must not be empty")));
        }
        let (record, _found) = state
            .storage
            .get_metric(&request.id, request.kind)
            .await
            .map_err(storage_failure)?;
        Ok::<_, Report<ApiError>>(record)
    }
    .await
    .map_err(reject)?;

    Ok(Json(record.to_envelope()))
}

#[handler]
pub async fn list_metrics(Data(state): Data<&Arc<AppState>>) -> poem::Result<Json<Vec<Metrics>>> {
    let mut records = state
        .storage
        .get_all()
        .await
        .map_err(|e| reject(storage_failure(e)))?;
    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(records.iter().map(Record::to_envelope).collect()))
}

#[handler]
pub async fn ping(Data(state): Data<&Arc<AppState>>) -> poem::Result<StatusCode> {
    state
        .storage
        .ping()
        .await
        .map_err(|e| reject(storage_failure(e)))?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use metrics_types::sign;
    use poem::test::TestClient;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::api::routes;
    use crate::storage::MemStorage;

    fn client(key: Option<&str>) -> TestClient<impl poem::Endpoint> {
        let state = AppState::new(Arc::new(MemStorage::new())).with_key(key);
        TestClient::new(routes(Arc::new(state)))
    }

    fn gzip(body: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).expect("gzip");
        encoder.finish().expect("gzip")
    }

    #[tokio::test]
    async fn path_update_then_raw_value() {
        let cli = client(None);

        cli.post("/update/gauge/Alloc/125.44")
            .send()
            .await
            .assert_status_is_ok();
        for _ in 0..2 {
            cli.post("/update/counter/PollCount/5")
                .send()
                .await
                .assert_status_is_ok();
        }

        let resp = cli.get("/value/gauge/Alloc").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("125.44").await;

        let resp = cli.get("/value/counter/PollCount").send().await;
        resp.assert_text("10").await;
    }

    #[tokio::test]
    async fn path_update_rejects_bad_input() {
        let cli = client(None);

        cli.post("/update/histogram/x/1")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.post("/update/counter/x/1.5")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.post("/update/gauge/x/abc")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.post("/update/gauge/x")
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn raw_value_of_unknown_metric_is_not_found() {
        let cli = client(None);

        cli.get("/value/counter/Unseen")
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
        cli.get("/value/bogus/Unseen")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn kind_change_is_a_bad_request() {
        let cli = client(None);

        cli.post("/update/counter/PollCount/1")
            .send()
            .await
            .assert_status_is_ok();
        cli.post("/update/")
            .body_json(&Metrics::gauge("PollCount", 1.0))
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.get("/value/counter/PollCount")
            .send()
            .await
            .assert_text("1")
            .await;
    }

    #[tokio::test]
    async fn json_update_answers_with_stored_state() {
        let cli = client(None);

        cli.post("/update/")
            .body_json(&Metrics::counter("PollCount", 5))
            .send()
            .await
            .assert_status_is_ok();
        let resp = cli
            .post("/update/")
            .body_json(&Metrics::counter("PollCount", 5))
            .send()
            .await;
        resp.assert_status_is_ok();
        let stored: Metrics = resp.json().await.value().deserialize();
        assert_eq!(stored, Metrics::counter("PollCount", 10));
    }

    #[tokio::test]
    async fn envelope_missing_its_payload_is_rejected() {
        let cli = client(None);

        cli.post("/update/")
            .content_type("application/json")
            .body(r#"{"id":"Alloc","type":"gauge","delta":3}"#)
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.post("/update/")
            .content_type("application/json")
            .body("not json")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn gzipped_signed_batch_is_accepted() {
        let cli = client(Some("secret"));
        let body = serde_json::to_vec(&vec![
            Metrics::gauge("Alloc", 1.5),
            Metrics::counter("PollCount", 2),
        ])
        .expect("json");

        cli.post("/updates/")
            .content_type("application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(HASH_HEADER, sign::sign(&body, b"secret"))
            .body(gzip(&body))
            .send()
            .await
            .assert_status_is_ok();

        let all: Vec<Metrics> = cli.get("/").send().await.json().await.value().deserialize();
        assert_eq!(
            all,
            vec![Metrics::gauge("Alloc", 1.5), Metrics::counter("PollCount", 2)]
        );
    }

    #[tokio::test]
    async fn signature_mismatch_is_rejected_before_storing() {
        let cli = client(Some("secret"));
        let body = serde_json::to_vec(&Metrics::gauge("Alloc", 1.5)).expect("json");

        cli.post("/update/")
            .content_type("application/json")
            .header(HASH_HEADER, sign::sign(&body, b"other key"))
            .body(body.clone())
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        cli.post("/value/")
            .body_json(&Metrics::zero("Alloc", MetricKind::Gauge))
            .send()
            .await
            .assert_json(&Metrics::gauge("Alloc", 0.0))
            .await;
    }

    #[tokio::test]
    async fn unsigned_request_passes_when_key_is_set() {
        let cli = client(Some("secret"));

        cli.post("/update/")
            .body_json(&Metrics::gauge("Alloc", 2.0))
            .send()
            .await
            .assert_status_is_ok();
    }

    #[tokio::test]
    async fn ping_reports_memory_backend_healthy() {
        client(None).get("/ping").send().await.assert_status_is_ok();
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let cli = client(None);

        // compresses to a few kilobytes
        let bomb = gzip(&vec![b' '; MAX_BODY_BYTES + 1]);
        assert!(bomb.len() < MAX_BODY_BYTES / 100);
        cli.post("/updates/")
            .content_type("application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(bomb)
            .send()
            .await
            .assert_status(StatusCode::PAYLOAD_TOO_LARGE);

        cli.post("/update/")
            .content_type("application/json")
            .body(vec![b' '; MAX_BODY_BYTES + 1])
            .send()
            .await
            .assert_status(StatusCode::PAYLOAD_TOO_LARGE);

        cli.get("/").send().await.assert_json(Vec::<Metrics>::new()).await;
    }
}
