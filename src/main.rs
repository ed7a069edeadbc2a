//! devstack - local development stacks
//!
//! This is the main CLI entry point for devstack.

use anyhow::Context;
use clap::{Parser, Subcommand};
use devstack::config::Settings;
use devstack::context::{CancelSignal, ExecutionContext};
use devstack::runtime::{probe, DockerCompose, OrchestrationRuntime};
use devstack::stack::{
    AccountIdentity, AccountProvisioner, LifecycleController, StackDefinition, StackState,
    StackStore, Topology,
};
use devstack::StackError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// devstack - local development stacks on Docker Compose
#[derive(Parser)]
#[command(name = "devstack")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Create, start and inspect local service stacks", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding stack definitions
    #[arg(short = 'd', long, global = true)]
    stack_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a stack from a services file
    Init {
        /// Stack name
        stack: String,
        /// YAML file with a `services:` list
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Start all services of a stack
    Start {
        /// Stack name
        stack: String,
    },

    /// Stop all services of a stack
    Stop {
        /// Stack name
        stack: String,
    },

    /// Show stack state and per-service health
    Status {
        /// Stack name
        stack: String,
    },

    /// Create an account inside a running node
    Create {
        /// Stack name
        stack: String,
        /// Organization owning the account
        org: String,
        /// Account name
        account: String,
    },

    /// Manage accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// List known stacks
    Ls,
}

#[derive(Subcommand)]
enum AccountCommands {
    /// List provisioned accounts
    #[command(name = "list")]
    List {
        /// Stack name
        stack: String,
        /// Only show accounts of this organization
        org: Option<String>,
    },
}

impl Commands {
    /// Commands that never talk to the container runtime
    fn is_offline(&self) -> bool {
        matches!(
            self,
            Commands::Ls
                | Commands::Accounts {
                    command: AccountCommands::List { .. }
                }
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let code = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<StackError>())
                .map(StackError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(dir) = cli.stack_dir {
        settings.stacks_dir = dir;
    }

    let (cancel_handle, cancel) = CancelSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            cancel_handle.cancel();
        }
    });

    let base_dir = settings.stacks_dir.clone();
    let ctx = Arc::new(ExecutionContext::new(settings).with_cancel(cancel));
    let runtime: Arc<dyn OrchestrationRuntime> = Arc::new(DockerCompose::new());

    if !cli.command.is_offline() {
        probe(&ctx, runtime.as_ref())
            .await
            .context("Container runtime check failed")?;
    }

    let controller = |stack: &str| {
        LifecycleController::new(ctx.clone(), runtime.clone(), stack, base_dir.clone())
    };

    match cli.command {
        Commands::Init { stack, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let topology = Topology::parse_str(&content)?;
            let definition = StackDefinition::new(&stack, topology.services)?;
            let created = controller(&stack).create(definition).await?;
            println!(
                "Stack {} created with {} service(s)",
                created.name,
                created.services.len()
            );
        }

        Commands::Start { stack } => {
            controller(&stack)
                .start()
                .await
                .with_context(|| format!("Failed to start stack {}", stack))?;
            println!("Stack {} is running", stack);
        }

        Commands::Stop { stack } => {
            controller(&stack)
                .stop()
                .await
                .with_context(|| format!("Failed to stop stack {}", stack))?;
            println!("Stack {} stopped", stack);
        }

        Commands::Status { stack } => {
            let controller = controller(&stack);
            let state = controller.status().await?;
            println!("{}: {}", stack, state);
            if state != StackState::Uninitialized {
                let health = controller.service_health().await?;
                println!("{:<24} {}", "SERVICE", "HEALTH");
                for (service, health) in &health {
                    println!("{:<24} {}", service, health);
                }
            }
        }

        Commands::Create {
            stack,
            org,
            account,
        } => {
            let identity = controller(&stack)
                .create_account(&org, &account)
                .await
                .with_context(|| format!("Failed to create account {}/{}", org, account))?;
            print_account(&identity);
        }

        Commands::Accounts { command } => match command {
            AccountCommands::List { stack, org } => {
                let controller = controller(&stack);
                let accounts = AccountProvisioner::new(&controller).list_accounts(org.as_deref())?;
                if accounts.is_empty() {
                    println!("No accounts");
                } else {
                    println!("{:<16} {:<16} {:<44} {}", "ORGANIZATION", "NAME", "ADDRESS", "CREATED");
                    for identity in &accounts {
                        println!(
                            "{:<16} {:<16} {:<44} {}",
                            identity.organization,
                            identity.name,
                            identity.address,
                            identity.created_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
            }
        },

        Commands::Ls => {
            let store = StackStore::new(&base_dir);
            let stacks = store.list()?;
            if stacks.is_empty() {
                println!("No stacks in {}", base_dir.display());
            }
            for name in stacks {
                println!("{}", name);
            }
        }
    }

    Ok(())
}

fn print_account(identity: &AccountIdentity) {
    println!("Organization: {}", identity.organization);
    println!("Account:      {}", identity.name);
    println!("Address:      {}", identity.address);
    println!("Key:          {}", identity.key_ref);
}
