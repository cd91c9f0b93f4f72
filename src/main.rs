use agentrun::config::AppConfig;
use agentrun::engine::{Engine, RequestContext};
use agentrun::executor::ExecutorRegistry;
use agentrun::server::{self, reload::load_checked, AppState, ServeOptions};
use agentrun::session::store_from_settings;
use agentrun::workflow::Workflow;
use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a workflow's target once and print its output
    Run {
        /// Path to the workflow file
        file: PathBuf,

        /// Request context as JSON, e.g. '{"method":"POST","body":{...}}'
        #[arg(long)]
        request_json: Option<String>,

        /// Log evaluation and dispatch decisions
        #[arg(long)]
        debug: bool,
    },
    /// Load and validate a workflow without running it
    Validate {
        /// Path to the workflow file
        file: PathBuf,
    },
    /// Serve the workflow over HTTP
    Serve {
        /// Path to the workflow file
        file: PathBuf,

        /// Reload the workflow when files next to it change
        #[arg(long)]
        dev: bool,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    init_tracing(config.debug);

    match args.command {
        Commands::Validate { file } => {
            let workflow = load_checked(&file)?;
            println!(
                "Workflow '{}' is valid ({} resources, target '{}')",
                workflow.metadata.name,
                workflow.resources.len(),
                workflow.target()
            );
        }
        Commands::Run {
            file,
            request_json,
            debug,
        } => {
            let workflow = load_checked(&file)?;
            let engine = build_engine(&workflow, &config)?.with_debug(debug || config.debug);

            let mut request = request_json
                .map(|raw| -> anyhow::Result<RequestContext> {
                    let value = serde_json::from_str(&raw).context("--request-json is not JSON")?;
                    Ok(RequestContext::from_json(value)?)
                })
                .transpose()?;

            let shutdown = shutdown_on_ctrl_c();
            let output = engine
                .execute_with_cancel(&workflow, request.as_mut(), shutdown)
                .await
                .with_context(|| format!("workflow '{}' failed", workflow.metadata.name))?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Serve {
            file,
            dev,
            host,
            port,
        } => {
            let workflow = load_checked(&file)?;
            let engine = build_engine(&workflow, &config)?.with_debug(config.debug);
            let options = serve_options(&workflow, &config, host, port, dev.then(|| file.clone()));
            log_startup(&file, &workflow, &options);

            let state = Arc::new(AppState::new(workflow, engine));
            server::serve(state, options, shutdown_on_ctrl_c()).await?;
        }
    }

    Ok(())
}

/// Registry with every built-in backend plus the workflow's session store
fn build_engine(workflow: &Workflow, config: &AppConfig) -> anyhow::Result<Engine> {
    let mut registry = ExecutorRegistry::with_defaults(config);
    if let Some(url) = &workflow.settings.agent_settings.ollama_url {
        log::info!("Using chat backend {}", url);
        registry.set_llm_executor(url);
    }
    let sessions = store_from_settings(&workflow.settings.session)
        .context("failed to open session store")?;
    Ok(Engine::new(registry).with_session_store(sessions))
}

/// CLI flags, then environment, then `settings.apiServer`
fn serve_options(
    workflow: &Workflow,
    config: &AppConfig,
    host: Option<String>,
    port: Option<u16>,
    watch: Option<PathBuf>,
) -> ServeOptions {
    let api = workflow.settings.api_server.clone().unwrap_or_default();
    let port = port.or(config.port).unwrap_or_else(|| {
        u16::try_from(api.port_num).unwrap_or_else(|_| {
            log::warn!("apiServer.portNum {} out of range; using 3000", api.port_num);
            3000
        })
    });
    ServeOptions {
        host: host.or_else(|| config.host.clone()).unwrap_or(api.host_ip),
        port,
        grace_period: config.grace_period,
        watch,
    }
}

fn log_startup(file: &Path, workflow: &Workflow, options: &ServeOptions) {
    log::info!(
        "Serving workflow '{}' from {} on {}:{}",
        workflow.metadata.name,
        file.display(),
        options.host,
        options.port
    );
    if let Some(api) = &workflow.settings.api_server {
        for route in &api.routes {
            log::info!("Route {} {:?}", route.path, route.methods);
        }
    }
    if options.watch.is_some() {
        log::info!("Dev mode: hot reload enabled");
    }
}

/// tower-http request spans are emitted through tracing, not log
fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        log::warn!("Tracing subscriber not installed: {}", e);
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl-C, shutting down");
            trigger.cancel();
        }
    });
    token
}
