use anyhow::Result;
use clap::Parser;
use metrics_server::app;
use metrics_server::ServerArgs;
use metrics_server::ServerConfig;
use tokio_util::sync::CancellationToken;
use utils::logging;
use utils::shutdown;
use utils::version;

fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let args = ServerArgs::parse();
    let _guard = logging::init("server");

    tracing::info!("Starting metrics server {}", &**version::VERSION);

    let config = ServerConfig::from(args);
    tracing::info!(
        address = %config.address,
        backend = ?config.backend,
        flush = ?config.flush,
        restore = config.restore,
        signed = config.key.is_some(),
        "server configured"
    );

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Err(err) = shutdown::wait_for_signal().await {
            tracing::error!("cannot listen for shutdown signals: {err}");
        }
        signal_token.cancel();
    });

    app::run(config, token)
        .await
        .map_err(|report| anyhow::anyhow!("{report:?}"))?;

    Ok(())
}
