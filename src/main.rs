use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use privgate::config::AppConfig;
use privgate::core::Result;
use privgate::logging;
use privgate::permission::{CoordinatorEvent, PermissionCoordinator, PrivilegedLauncher};
use privgate::store::{ConfigStore, FlagStore, StoreOptions};
use privgate::ui::{CommandLauncher, ConsoleApprovalUI, ConsoleInput, ConsolePrompter, ManualLauncher};

#[derive(Parser, Debug)]
#[command(name = "privgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file holding the permission flag (overrides the config)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Log to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show whether privileged mode is permitted
    Status,
    /// Set the permission flag
    Grant,
    /// Clear the permission flag
    Revoke,
    /// Ask for approval until privileged mode is permitted or abandoned
    Approve,
    /// Keep permission in sync and report changes until interrupted
    Watch,
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigSubcommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigSubcommands {
    Init,
    Where,
}

fn build_coordinator(options: &StoreOptions, config: &AppConfig) -> Result<PermissionCoordinator> {
    let store = Arc::new(ConfigStore::new(options.clone()));
    let input = Arc::new(ConsoleInput::new());
    let ui = Arc::new(ConsoleApprovalUI::new(
        Arc::clone(&input),
        options.path.display().to_string(),
    ));
    let prompter = Arc::new(ConsolePrompter::new(input));

    let launcher: Arc<dyn PrivilegedLauncher> = match config.launch_command() {
        Some(command) => Arc::new(CommandLauncher::new(command)?),
        None => Arc::new(ManualLauncher),
    };

    Ok(PermissionCoordinator::new(store, ui, launcher, prompter))
}

fn describe(granted: bool) -> &'static str {
    if granted { "granted" } else { "not granted" }
}

async fn watch(coordinator: &PermissionCoordinator) {
    let mut events = coordinator.subscribe();
    let granted = coordinator.initialize_permissions().await;
    println!("Privileged mode {}", describe(granted));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(CoordinatorEvent::PermissionGranted) => println!("Privileged mode granted"),
                Ok(CoordinatorEvent::PermissionRevoked) => println!("Privileged mode revoked"),
                Ok(CoordinatorEvent::OptedOut) => {
                    println!("Opted out of privileged mode");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed coordinator events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose);

    if let Commands::Config { command } = &cli.command {
        match command {
            ConfigSubcommands::Init => match AppConfig::init_default() {
                Ok(path) => println!("✓ Created config file at {}", path.display()),
                Err(e) => {
                    eprintln!("✗ Failed to create config: {e}");
                    return Ok(ExitCode::FAILURE);
                }
            },
            ConfigSubcommands::Where => match AppConfig::get_config_path() {
                Some(path) => println!("{}", path.display()),
                None => eprintln!("✗ Could not determine config path"),
            },
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = AppConfig::load();
    let options = config.store_options(cli.file.clone())?;
    tracing::debug!(path = %options.path.display(), field = %options.flag_field, "Using permission file");

    let exit = match cli.command {
        Commands::Status => {
            let coordinator = build_coordinator(&options, &config)?;
            let granted = coordinator.check_permission().await;
            println!("Privileged mode {} ({})", describe(granted), options.path.display());
            ExitCode::SUCCESS
        }
        Commands::Grant => {
            let coordinator = build_coordinator(&options, &config)?;
            if coordinator.grant_permission().await {
                println!("✓ Privileged mode granted");
                ExitCode::SUCCESS
            } else {
                eprintln!("✗ Failed to grant privileged mode");
                ExitCode::FAILURE
            }
        }
        Commands::Revoke => {
            let store = ConfigStore::new(options.clone());
            match store.write(false).await {
                Ok(()) => {
                    println!("✓ Privileged mode revoked");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("✗ Failed to revoke privileged mode: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Approve => {
            let coordinator = build_coordinator(&options, &config)?;
            let granted = coordinator.initialize_permissions().await;
            coordinator.dispose();
            println!("Privileged mode {}", describe(granted));
            if granted { ExitCode::SUCCESS } else { ExitCode::FAILURE }
        }
        Commands::Watch => {
            let coordinator = build_coordinator(&options, &config)?;
            watch(&coordinator).await;
            coordinator.dispose();
            ExitCode::SUCCESS
        }
        Commands::Config { .. } => unreachable!(),
    };

    Ok(exit)
}
