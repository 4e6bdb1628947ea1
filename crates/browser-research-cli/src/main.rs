//! Browser research orchestrator CLI: entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;
use url::Url;

use browser_research::http_client::HttpClient;
use browser_research::normalize::normalize_url;
use browser_research::{
    Orchestrator, OrchestratorConfig, OrchestratorEvent, QueryAnalysis, ResearchPlan, RobotsGate,
};

#[derive(Parser)]
#[command(
    name = "browser-research",
    about = "Run research plans across web search, encyclopedia, academic and page sources",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "browser-research.toml", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Output {
    /// Full result as JSON.
    Json,
    /// Numbered sources and gaps for the report writer, as JSON.
    Handoff,
    /// Markdown `## References` section.
    References,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a research plan.
    ///
    /// The plan comes from `--plan` (a plan JSON file), from `--analysis`
    /// (the planner's query analysis) together with `--query`, or from
    /// `--query` alone (a single web search).
    Run {
        /// Research plan JSON file.
        #[arg(long, conflicts_with = "analysis")]
        plan: Option<PathBuf>,

        /// Query analysis JSON file (`search_terms`, `priority_order`).
        #[arg(long, requires = "query")]
        analysis: Option<PathBuf>,

        /// Research query.
        #[arg(short, long)]
        query: Option<String>,

        /// Output format.
        #[arg(short, long, value_enum, default_value_t = Output::Json)]
        output: Output,

        /// Cancel the plan after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Log orchestrator events as they happen.
        #[arg(long)]
        events: bool,
    },

    /// Ask the robots gate whether a URL may be fetched.
    CheckRobots {
        url: String,

        /// User agent to evaluate (defaults to the configured one).
        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Print the effective configuration as JSON.
    ShowConfig,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   browser-research completions bash > ~/.local/share/bash-completion/completions/browser-research
    ///   browser-research completions zsh > ~/.zfunc/_browser-research
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {what} {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {what} {}", path.display()))
}

fn load_plan(
    plan: Option<PathBuf>,
    analysis: Option<PathBuf>,
    query: Option<String>,
) -> anyhow::Result<ResearchPlan> {
    match (plan, analysis, query) {
        (Some(path), _, _) => read_json(&path, "plan"),
        (None, Some(path), Some(query)) => {
            let analysis: QueryAnalysis = read_json(&path, "query analysis")?;
            Ok(ResearchPlan::from_analysis(&query, &analysis))
        }
        (None, None, Some(query)) => Ok(ResearchPlan::fallback(&query)),
        _ => bail!("nothing to run: pass --plan, or --query (optionally with --analysis)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Run {
            plan,
            analysis,
            query,
            output,
            timeout,
            events,
        } => {
            let mut config = OrchestratorConfig::load(&cli.config)?;
            if timeout.is_some() {
                config.execution.plan_timeout_secs = timeout;
            }
            let plan = load_plan(plan, analysis, query)?;
            let orchestrator = Orchestrator::from_config(config)?;

            let cancel = CancellationToken::new();
            let maintenance = orchestrator.spawn_maintenance(cancel.child_token());
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received, cancelling plan");
                        cancel.cancel();
                    }
                });
            }
            if events {
                let mut rx = orchestrator.events().subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        let done = matches!(event, OrchestratorEvent::PlanComplete { .. });
                        match serde_json::to_string(&event) {
                            Ok(line) => tracing::info!("event {line}"),
                            Err(e) => tracing::warn!("unserialisable event: {e}"),
                        }
                        if done {
                            break;
                        }
                    }
                });
            }

            let result = orchestrator.execute_with_cancel(&plan, cancel.clone()).await?;
            cancel.cancel();
            for handle in maintenance {
                let _ = handle.await;
            }

            match output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                Output::Handoff => println!("{}", serde_json::to_string_pretty(&result.handoff())?),
                Output::References => print!("{}", result.references_markdown()),
            }
            if result.cancelled {
                std::process::exit(130);
            }
        }

        Commands::CheckRobots { url, user_agent } => {
            let config = OrchestratorConfig::load(&cli.config)?;
            let url: Url = normalize_url(&url).with_context(|| format!("invalid url {url:?}"))?;
            let http = HttpClient::new(&config.robots.user_agent, config.robots.fetch_timeout_ms);
            let gate = RobotsGate::new(Arc::new(http), config.robots.clone());
            let agent = user_agent.unwrap_or_else(|| gate.user_agent().to_string());

            let allowed = gate.permits(&url, &agent).await;
            println!("{} {url} for {agent:?}", if allowed { "ALLOWED" } else { "DENIED" });
            for (origin, reason) in gate.degraded_origins() {
                println!("  degraded: {origin}: {reason}");
            }
            if !allowed {
                std::process::exit(1);
            }
        }

        Commands::ShowConfig => {
            let mut config = OrchestratorConfig::load(&cli.config)?;
            if config.sources.web_search.api_key.is_some() {
                config.sources.web_search.api_key = Some("<redacted>".into());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "browser-research",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser_research::SourceKind;

    #[test]
    fn test_query_alone_is_a_web_search() {
        let plan = load_plan(None, None, Some("rust async".into())).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks()[0].source_kind, SourceKind::WebSearch);
    }

    #[test]
    fn test_analysis_file_builds_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.json");
        std::fs::write(
            &path,
            r#"{"search_terms": {"arxiv": ["attention"], "wikipedia": ["transformer"]},
                "priority_order": ["wikipedia", "arxiv"]}"#,
        )
        .unwrap();

        let plan = load_plan(None, Some(path), Some("transformers".into())).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.priority_order()[0], SourceKind::Encyclopedia);
    }

    #[test]
    fn test_nothing_to_run() {
        assert!(load_plan(None, None, None).is_err());
    }
}
