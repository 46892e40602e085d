use anyhow::Result;
use clap::{Parser, Subcommand};
use hkb_sync::{
    execute_trigger, load_plan_or_default, maybe_build_scheduler, HarvestConfig, TriggerRequest,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hkb-cli")]
#[command(about = "Health Knowledge Base harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental harvest and print the trigger response as JSON.
    Harvest {
        /// Target bucket; falls back to HKB_BUCKET.
        #[arg(long)]
        bucket: Option<String>,
        /// Search queries; falls back to harvest.yaml, then the defaults.
        #[arg(long = "query")]
        queries: Vec<String>,
        #[arg(long)]
        max_results: Option<usize>,
        #[arg(long)]
        prefix: Option<String>,
        /// Re-fetch and re-store documents even when already tracked.
        #[arg(long)]
        force: bool,
    },
    /// Run the cron-driven harvest loop until interrupted.
    Schedule,
    /// Serve the database and agent façades.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Harvest {
        bucket: None,
        queries: Vec::new(),
        max_results: None,
        prefix: None,
        force: false,
    }) {
        Commands::Harvest {
            bucket,
            queries,
            max_results,
            prefix,
            force,
        } => {
            let config = HarvestConfig::from_env();
            let plan = load_plan_or_default(&config.workspace_root).await?;
            let request = TriggerRequest {
                bucket_name: bucket,
                search_queries: if queries.is_empty() { plan.queries } else { queries },
                max_results_per_query: max_results.unwrap_or(plan.max_results_per_query),
                s3_prefix: prefix.unwrap_or(plan.prefix),
                force_update: force,
            };
            let response = execute_trigger(&config, request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Schedule => {
            let mut config = HarvestConfig::from_env();
            config.scheduler_enabled = true;
            if let Some(scheduler) = maybe_build_scheduler(&config).await? {
                scheduler.start().await?;
                tracing::info!(cron = %config.harvest_cron, "harvest scheduler running, ctrl-c to stop");
                tokio::signal::ctrl_c().await?;
            }
        }
        Commands::Serve => {
            hkb_web::serve_from_env().await?;
        }
    }

    Ok(())
}
