use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use poem::listener::TcpListener;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::routes;
use super::AppState;
use crate::error::ApiError;

/// In-flight requests get this long to finish once shutdown starts.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP server for the metric API
pub struct ApiServer {
    listen_addr: String,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(listen_addr: impl Into<String>, state: Arc<AppState>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            state,
        }
    }

    /// Serves requests until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.state);
        let listener = TcpListener::bind(self.listen_addr.clone());
        let server = Server::new(listener);

        match server
            .run_with_graceful_shutdown(app, token.cancelled(), Some(GRACEFUL_TIMEOUT))
            .await
        {
            Ok(()) => {
                info!("API server stopped");
                Ok(())
            }
            Err(e) => {
                error!("API server failed: {e}");
                Err(Report::new(ApiError::ServerError {
                    message: format!("Server failed on {}: {e}", self.listen_addr),
                }))
            }
        }
    }
}
