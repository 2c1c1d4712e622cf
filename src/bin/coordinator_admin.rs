//! Operator CLI for the agorum coordinator: prints resolved configuration
//! and can run a one-off pipeline template against a fresh coordinator
//! instance for smoke-testing. Not part of the coordination core's
//! contract — a convenience wrapper only.

use agorum::config::CoordinatorConfig;
use agorum::coordinator::Coordinator;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agorum-admin", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints the configuration that would be loaded from the environment.
    PrintConfig,
    /// Instantiates and runs one pipeline template, printing the result.
    RunPipeline {
        /// Template id: `pricing_update`, `inventory_sync`, `content_generation`, or `full_marketplace_cycle`.
        template: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let args = Args::parse();

    match args.command {
        Command::PrintConfig => {
            let config = CoordinatorConfig::from_env();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::RunPipeline { template } => {
            let config = CoordinatorConfig::from_env();
            let coordinator = Coordinator::build(config).await?;
            let instance_id = format!("admin-smoke-{template}");
            coordinator.pipelines.create_from_template(&template, instance_id.clone())?;
            let result = coordinator.pipelines.execute(&instance_id, serde_json::json!({"source": "coordinator-admin"}), None).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
