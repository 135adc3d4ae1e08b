use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use review_agents::backends::build_backends;
use review_agents::config::ReviewConfig;
use review_agents::review::{run_review, ReviewInvocation, ReviewType};
use review_coordination::contract::review_result_schema;
use review_coordination::error::exit_code;
use review_coordination::routes::{CascadeOptions, EnvSnapshot};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "review-agents", version, about = "Automated review through a backend cascade")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Review a document or diff and write the result as JSON.
    Review {
        #[arg(long = "type", value_enum, default_value_t = ReviewType::Code)]
        review_type: ReviewType,
        #[arg(long)]
        content: PathBuf,
        #[arg(long)]
        expertise: Option<PathBuf>,
        #[arg(long)]
        context: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 1)]
        iteration: u32,
        /// Previous iteration's result, for re-review.
        #[arg(long)]
        previous: Option<PathBuf>,
        /// Single combined pass.
        #[arg(long)]
        fast: bool,
        /// Let agent backends read the changed files.
        #[arg(long)]
        tool_access: bool,
        /// Per-attempt timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a JSON schema.
    Schema {
        #[arg(long, value_enum, default_value_t = SchemaKind::Result)]
        kind: SchemaKind,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaKind {
    Result,
    Config,
}

#[tokio::main]
async fn main() {
    // stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            exit_code::NO_VIABLE_ROUTE
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Schema { kind } => {
            let schema = match kind {
                SchemaKind::Result => review_result_schema(),
                SchemaKind::Config => serde_json::to_value(schemars::schema_for!(ReviewConfig))?,
            };
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(exit_code::SUCCESS)
        }
        Command::Review {
            review_type,
            content,
            expertise,
            context,
            output,
            iteration,
            previous,
            fast,
            tool_access,
            timeout,
            config,
        } => {
            let config = ReviewConfig::load(config.as_deref())?;
            let project_root = std::env::current_dir().context("Cannot determine working directory")?;
            let backends = build_backends(&config, &project_root, tool_access).await?;
            let invocation = ReviewInvocation {
                review_type,
                content_path: content,
                expertise_path: expertise,
                context_path: context,
                output_path: output,
                iteration,
                previous_path: previous,
                fast,
                timeout_seconds: timeout,
            };
            let env = EnvSnapshot::capture();
            Ok(run_review(&invocation, &config, &env, backends, CascadeOptions::default()).await)
        }
    }
}
