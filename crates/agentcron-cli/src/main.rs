mod remote;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use agentcron_config::{AgentCronConfig, InvokerConfig};
use agentcron_cron::{CronRuntime, schedule};
use agentcron_types::ScheduleSpec;
use remote::RemoteClient;

#[derive(Parser)]
#[command(name = "agentcron", about = "Scheduled agent task runner")]
struct Cli {
    /// Config file (defaults to ~/.agentcron/config.json5)
    #[arg(long, global = true, env = "AGENTCRON_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and the REST gateway
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show the effective configuration
    Health,
    /// Preview the next trigger times of a schedule
    Next {
        #[command(flatten)]
        schedule: ScheduleArgs,

        /// Number of trigger times to print
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Trigger a task on a running gateway
    Run {
        /// Task id
        task_id: String,

        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Show scheduler and executor status of a running gateway
    Stats {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ScheduleArgs {
    /// Fixed interval in minutes
    #[arg(long)]
    every: Option<u32>,

    /// Five-field cron expression
    #[arg(long)]
    cron: Option<String>,

    /// One-shot instant (RFC 3339)
    #[arg(long)]
    at: Option<DateTime<Utc>>,
}

impl ScheduleArgs {
    fn into_spec(self) -> anyhow::Result<ScheduleSpec> {
        match (self.every, self.cron, self.at) {
            (Some(minutes), None, None) => Ok(ScheduleSpec::Interval { minutes }),
            (None, Some(expression), None) => Ok(ScheduleSpec::Cron { expression }),
            (None, None, Some(execute_at)) => Ok(ScheduleSpec::Once { execute_at }),
            _ => anyhow::bail!("exactly one of --every, --cron or --at is required"),
        }
    }
}

#[derive(Args)]
struct RemoteArgs {
    /// Gateway base URL (defaults to the configured host and port)
    #[arg(long, env = "AGENTCRON_URL")]
    url: Option<String>,

    /// Bearer token (defaults to gateway.auth_token)
    #[arg(long, env = "AGENTCRON_TOKEN")]
    token: Option<String>,
}

impl RemoteArgs {
    fn client(self, config: &AgentCronConfig) -> RemoteClient {
        let url = self.url.unwrap_or_else(|| {
            format!("http://{}:{}", config.gateway.host, config.gateway.port)
        });
        RemoteClient::new(&url, self.token.or_else(|| config.gateway.auth_token.clone()))
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve the config path and load it.
fn load(config: Option<PathBuf>) -> anyhow::Result<(PathBuf, AgentCronConfig)> {
    match config {
        Some(path) => {
            let loaded = agentcron_config::load_config_from(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            Ok((path, loaded))
        }
        None => Ok((
            agentcron_config::config_file_path()?,
            agentcron_config::load_config()?,
        )),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Serve { port } => {
            let (path, config) = load(cli.config)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(path, config, port))?;
        }
        Commands::Health => {
            let (path, config) = load(cli.config)?;
            println!("agentcron is healthy");
            println!("  config: {}", path.display());
            println!("  database: {}", config.db_path()?.display());
            println!(
                "  gateway: http://{}:{}",
                config.gateway.host, config.gateway.port
            );
            println!("  scheduler enabled: {}", config.scheduler.enabled);
            println!("  max concurrent: {}", config.executor.max_concurrent);
            println!("  invoker: {}", describe_invoker(&config.invoker));
        }
        Commands::Next { schedule: args, count } => {
            let spec = args.into_spec()?;
            for at in schedule::upcoming(&spec, Utc::now(), count)? {
                println!("{}", at.to_rfc3339());
            }
        }
        Commands::Run { task_id, remote } => {
            let (_, config) = load(cli.config)?;
            let client = remote.client(&config);
            let rt = tokio::runtime::Runtime::new()?;
            let body = rt.block_on(client.post(&format!("/scheduled-tasks/{task_id}/run")))?;
            println!("{}", body["executionId"].as_str().unwrap_or_default());
        }
        Commands::Stats { remote } => {
            let (_, config) = load(cli.config)?;
            let client = remote.client(&config);
            let rt = tokio::runtime::Runtime::new()?;
            let body = rt.block_on(client.get("/status"))?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

async fn serve(config_path: PathBuf, config: AgentCronConfig, port: Option<u16>) -> anyhow::Result<()> {
    let runtime = Arc::new(CronRuntime::from_config(&config)?);
    runtime.bootstrap().await?;

    let shutdown = CancellationToken::new();
    let scheduler = runtime.spawn_scheduler(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal.cancel();
    });

    let served = agentcron_gateway::start_gateway(
        runtime.clone(),
        &config.gateway,
        port,
        Some(config_path),
        shutdown.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"));

    shutdown.cancel();
    let _ = scheduler.await;
    runtime.shutdown().await;
    served
}

fn describe_invoker(invoker: &InvokerConfig) -> String {
    match invoker {
        InvokerConfig::Command { program, .. } => format!("command ({program})"),
        InvokerConfig::Http { url, .. } => format!("http ({url})"),
    }
}
