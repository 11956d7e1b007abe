use anyhow::Result;
use clap::Parser;
use metrics_agent::agent;
use metrics_agent::AgentArgs;
use metrics_agent::AgentConfig;
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

    let args = AgentArgs::parse();
    let _guard = logging::init("agent");

    tracing::info!("Starting metrics agent {}", &**version::VERSION);

    let config = AgentConfig::from(args);
    let token = CancellationToken::new();

    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Err(err) = shutdown::wait_for_signal().await {
            tracing::error!("cannot listen for shutdown signals: {err}");
        }
        signal_token.cancel();
    });

    agent::run(config, token)
        .await
        .map_err(|report| anyhow::anyhow!("{report:?}"))?;

    Ok(())
}
