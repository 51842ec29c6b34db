use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use tls_prober::cli::Cli;
use tls_prober::output::OutputSink;
use tls_prober::{ProbeRegistry, Scanner};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let cfg = cli.into_config()?;

    let registry = ProbeRegistry::builtin();
    if cfg.list_probes {
        for id in registry.ids() {
            println!("{id}");
        }
        return Ok(());
    }

    let probes = registry.resolve(&cfg.probes)?;
    let targets = cfg.load_targets().await?;
    if targets.is_empty() {
        anyhow::bail!("no valid targets to scan");
    }
    let stores = cfg.load_trust_stores()?;
    tracing::info!(
        targets = targets.len(),
        probes = probes.len(),
        stores = stores.len(),
        "starting scan"
    );

    let scanner = Arc::new(Scanner::new(cfg.scan.clone())?.with_trust_stores(stores));
    let stop = scanner.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing running probes");
            stop.cancel();
        }
    });

    let sink = OutputSink::new(cfg.output.clone())?;
    let mut results = scanner.scan_stream(targets, probes)?;
    while let Some((target, result)) = results.next().await {
        match result {
            Ok(report) => sink.emit(report).await?,
            Err(err) => sink.emit_error(target.view(), err.to_string()).await?,
        }
    }
    sink.shutdown().await?;

    Ok(())
}
