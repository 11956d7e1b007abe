use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::api::ApiServer;
use crate::api::AppState;
use crate::checkpoint::spawn_flush_task;
use crate::checkpoint::Checkpoint;
use crate::config::FlushPolicy;
use crate::config::ServerConfig;
use crate::config::StorageBackend;
use crate::error::ApiError;
use crate::storage::MemStorage;
use crate::storage::MetricStorage;
use crate::storage::SqlStorage;

/// Storage plus whatever keeps it durable.
struct Components {
    storage: Arc<dyn MetricStorage>,
    checkpoint: Option<Arc<Checkpoint>>,
}

async fn build_components(config: &ServerConfig) -> Result<Components, Report<ApiError>> {
    let startup = || ApiError::ServerError {
        message: "cannot prepare storage".to_string(),
    };

    match &config.backend {
        StorageBackend::Memory => {
            let checkpoint = Arc::new(Checkpoint::new(config.checkpoint_path.clone()));
            let storage = MemStorage::new();
            if config.restore {
                let records = checkpoint.restore().await.change_context_lazy(startup)?;
                storage.replace_all(records);
            }
            info!(metrics = storage.len(), "using in-memory storage");
            Ok(Components {
                storage: Arc::new(storage),
                checkpoint: Some(checkpoint),
            })
        }
        StorageBackend::Sql { dsn } => {
            let storage = SqlStorage::open(dsn, config.backoff.clone())
                .await
                .change_context_lazy(startup)?;
            info!("using SQL storage");
            Ok(Components {
                storage: Arc::new(storage),
                checkpoint: None,
            })
        }
    }
}

/// Runs the collector until `token` is cancelled or the HTTP server fails.
///
/// Startup fails if the checkpoint cannot be restored or the database cannot
/// be opened. On the way out the in-memory store is checkpointed once more.
///
/// # Errors
///
/// - [`ApiError::ServerError`] on startup failures and when the listener fails
pub async fn run(config: ServerConfig, token: CancellationToken) -> Result<(), Report<ApiError>> {
    let Components {
        storage,
        checkpoint,
    } = build_components(&config).await?;

    let mut state = AppState::new(Arc::clone(&storage)).with_key(config.key.as_deref());
    let mut flush_task: Option<JoinHandle<()>> = None;
    if let Some(checkpoint) = &checkpoint {
        match config.flush {
            FlushPolicy::Periodic(interval) => {
                flush_task = Some(spawn_flush_task(
                    Arc::clone(checkpoint),
                    Arc::clone(&storage),
                    interval,
                    token.child_token(),
                ));
            }
            FlushPolicy::Synchronous => {
                state = state.with_sync_checkpoint(Arc::clone(checkpoint));
            }
        }
    }

    let result = ApiServer::new(config.address.clone(), Arc::new(state))
        .run(token.clone())
        .await;
    token.cancel();

    match flush_task {
        Some(task) => {
            if let Err(e) = task.await {
                error!("checkpoint task failed: {e}");
            }
        }
        None => {
            if let Some(checkpoint) = &checkpoint {
                match checkpoint.flush(storage.as_ref()).await {
                    Ok(written) => info!(metrics = written, "final checkpoint written"),
                    Err(err) => error!("final checkpoint failed: {err:?}"),
                }
            }
        }
    }

    info!("server stopped");
    result
}
