//! Weave CLI: command-line entry point for the workflow orchestration core.
//!
//! Reuses the same services (weave-core) and server bootstrap
//! (weave-server) that back the HTTP API.

use clap::{Parser, Subcommand};

use weave_cli::commands;

/// Weave: multi-agent workflow orchestration
#[derive(Parser)]
#[command(name = "weave", version, about = "Weave: multi-agent workflow orchestration")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "WEAVE_DB_PATH", default_value = "weave.db", global = true)]
    db: String,

    /// YAML file with engine tunables (retry policy, timeouts, tools)
    #[arg(long, env = "WEAVE_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Weave HTTP server
    Server {
        /// Host to bind to
        #[arg(long, env = "WEAVE_HOST", default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, env = "WEAVE_PORT", default_value_t = 3210)]
        port: u16,
    },

    /// Validate a workflow definition file (YAML or JSON)
    Validate {
        /// Path to the definition
        file: String,
    },

    /// Store and inspect workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Inspect agent registrations
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Validate and store a definition as a draft workflow
    Submit {
        /// Path to the definition (YAML or JSON)
        file: String,
    },
    /// Show a workflow with its step statuses
    Get {
        /// Workflow ID
        id: String,
    },
    /// List workflows
    List {
        /// Filter by status: draft, running, waiting, completed, failed, cancelled
        #[arg(long)]
        status: Option<String>,
    },
    /// Print the event journal of a workflow
    Events {
        /// Workflow ID
        id: String,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List persisted agent registrations
    List,
}

async fn with_state<F, Fut>(cli_db: &str, config: Option<&str>, f: F) -> Result<(), String>
where
    F: FnOnce(weave_core::state::AppState) -> Fut,
    Fut: std::future::Future<Output = Result<serde_json::Value, String>>,
{
    let engine_config = commands::load_config(config)?;
    let state = commands::init_state(cli_db, engine_config)?;
    let value = f(state).await?;
    commands::print_json(&value);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weave_core=warn,weave_server=info,weave_cli=info,tower_http=info".into()),
        )
        .init();

    let db = cli.db.clone();
    let config = cli.config.clone();

    let result = match cli.command {
        Some(Commands::Server { host, port }) => {
            commands::server::run(host, port, db, config).await
        }

        Some(Commands::Validate { file }) => {
            commands::workflow::validate(&file).map(|v| commands::print_json(&v))
        }

        Some(Commands::Workflow { action }) => match action {
            WorkflowAction::Submit { file } => {
                with_state(&db, config.as_deref(), |state| async move {
                    commands::workflow::submit(&state, &file).await
                })
                .await
            }
            WorkflowAction::Get { id } => {
                with_state(&db, config.as_deref(), |state| async move {
                    commands::workflow::get(&state, &id).await
                })
                .await
            }
            WorkflowAction::List { status } => {
                with_state(&db, config.as_deref(), |state| async move {
                    commands::workflow::list(&state, status.as_deref()).await
                })
                .await
            }
            WorkflowAction::Events { id } => {
                with_state(&db, config.as_deref(), |state| async move {
                    commands::workflow::events(&state, &id).await
                })
                .await
            }
        },

        Some(Commands::Agent { action }) => match action {
            AgentAction::List => {
                with_state(&db, config.as_deref(), |state| async move {
                    commands::agent::list(&state).await
                })
                .await
            }
        },

        None => {
            // No subcommand: show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
