use anyhow::Context;
use knapsack_cli::{init_tracing, serve};
use knapsack_sandbox::factory::{build_backend, build_research, build_store};
use knapsack_sandbox::{BrokerSettings, ExecutionBroker, ToolDispatcher};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let settings = BrokerSettings::from_env().context("Invalid knapsack configuration")?;

    let store = build_store(&settings)
        .await
        .context("Failed to open artifact store")?;
    let backend = build_backend(&settings)
        .await
        .context("Failed to set up isolation backend")?;
    let research = build_research(&settings).context("Failed to set up research client")?;

    let broker = Arc::new(ExecutionBroker::new(
        store,
        backend,
        settings.broker_options(),
    ));
    let dispatcher = ToolDispatcher::new(broker, research, settings.research_top_k);

    info!("Knapsack ready, reading tool calls from stdin");

    tokio::select! {
        result = serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), &dispatcher) => {
            let handled = result.context("Tool protocol I/O failed")?;
            info!("Input closed after {} tool calls", handled);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    Ok(())
}
