//! Main entry point for the Agent Memory Platform CLI.

use agent_memory_platform::{
    agent::RequestContext,
    batch, cli,
    memory::Tier,
    orchestrator::{Orchestrator, RememberOptions},
    server,
    settings::Settings,
    telemetry,
};
use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let settings = Settings::load()?;
    telemetry::init(&settings.logging)?;

    match args.command {
        cli::Commands::Serve { addr } => server::serve(settings, addr).await,
        cli::Commands::Run { config } => batch::run(config, settings).await,
        cli::Commands::Remember { text, hot } => {
            let orchestrator = Orchestrator::new(settings).await?;
            let options = RememberOptions {
                tier: hot.then_some(Tier::L0),
                ..Default::default()
            };
            let result = orchestrator
                .remember_with(&RequestContext::default(), &text, options)
                .await;
            orchestrator.shutdown().await;
            println!("{}", result?);
            Ok(())
        }
        cli::Commands::Recall { query, top_k } => {
            let orchestrator = Orchestrator::new(settings).await?;
            let result = orchestrator
                .recall_scored(&RequestContext::default(), &query, Some(top_k))
                .await;
            orchestrator.shutdown().await;
            let hits = result?;
            if hits.is_empty() {
                println!("No memories matched '{}'", query);
            }
            for hit in hits {
                let text = hit.item.content.as_text().unwrap_or("<binary>");
                println!("{:.3}  [{}]  {}  {}", hit.score, hit.source, hit.item.id, text);
            }
            Ok(())
        }
        cli::Commands::Circuits => {
            let orchestrator = Orchestrator::new(settings).await?;
            println!("{}", serde_json::to_string_pretty(&orchestrator.circuits())?);
            orchestrator.shutdown().await;
            Ok(())
        }
    }
}
