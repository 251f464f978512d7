use agent_bus::error::display_error;
use agent_bus::persistence::{FileSystemPersistence, MessageFilter, MessagePersistence};
use agent_bus::settings::Settings;
use agent_bus::workflow::{TransitionResult, WorkflowData, WorkflowManager, WorkflowState};
use agent_bus::{
    log_format, setup_logging, AgentBehavior, AgentConfig, BusAgent, BusConfig,
    CommandOptions, Message, MessageBus, Priority,
};
use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "agent-bus")]
#[command(author, version, about = "In-process agent message bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo agent and a two-stage workflow on a fresh bus
    Demo {
        /// Seconds to wait for each reply
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List messages waiting in a persistence store
    Pending {
        /// Store directory
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Check the effective configuration
    Validate,
    /// Write a default configuration file
    Init {
        /// Destination (defaults to the user config directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with configurable format
    let format = log_format(cli.json);
    setup_logging(format, &cli.log_level);

    debug!(
        version = agent_bus::VERSION,
        format = %format,
        "agent-bus starting"
    );

    if let Err(e) = run(cli).await {
        if let Some(err) = e.downcast_ref::<agent_bus::Error>() {
            display_error(err);
            std::process::exit(err.exit_code());
        }
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Demo { timeout } => {
            let settings = load_settings(cli.config.as_deref())?;
            tokio::select! {
                result = cmd_demo(settings, Duration::from_secs(timeout)) => result?,
                _ = tokio::signal::ctrl_c() => warn!("Interrupted"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(cli.config.as_deref())?,
            ConfigAction::Validate => cmd_config_validate(cli.config.as_deref())?,
            ConfigAction::Init { path, force } => {
                let path = match path.or(cli.config) {
                    Some(p) => p,
                    None => default_config_path()
                        .context("no user configuration directory; pass --path")?,
                };
                cmd_config_init(&path, force)?
            }
        },
        Commands::Pending { dir } => cmd_pending(&dir).await?,
    }
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("agent-bus").join("config.toml"))
}

/// File (explicit, else default if present) overlaid with the environment.
fn load_settings(explicit: Option<&Path>) -> anyhow::Result<Settings> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    let mut settings = match &path {
        Some(p) => {
            if !p.exists() {
                return Err(agent_bus::Error::config_file_not_found(p.display().to_string()).into());
            }
            debug!(path = %p.display(), "Loading configuration");
            Settings::load_from_file(p).map_err(agent_bus::Error::from)?
        }
        None => Settings::default(),
    };
    settings.merge_with_env();
    Ok(settings)
}

fn cmd_config_show(explicit: Option<&Path>) -> anyhow::Result<()> {
    let settings = load_settings(explicit)?;
    let rendered = toml::to_string_pretty(&settings).context("rendering configuration")?;
    print!("{}", rendered);
    Ok(())
}

fn cmd_config_validate(explicit: Option<&Path>) -> anyhow::Result<()> {
    let settings = load_settings(explicit)?;
    settings.validate().map_err(agent_bus::Error::from)?;
    println!("Configuration is valid");
    Ok(())
}

fn cmd_config_init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| agent_bus::Error::directory_create_error(parent.display().to_string(), e))?;
    }
    Settings::default()
        .save_to_file(path)
        .map_err(agent_bus::Error::from)?;
    info!(path = %path.display(), "Configuration written");
    println!("Wrote {}", path.display());
    Ok(())
}

// ============================================================================
// Pending store inspection
// ============================================================================

async fn cmd_pending(dir: &Path) -> anyhow::Result<()> {
    let store = FileSystemPersistence::open(dir).await?;
    let ids = store.list(&MessageFilter::pending()).await?;
    if ids.is_empty() {
        println!("No pending messages in {}", dir.display());
        return Ok(());
    }

    for id in &ids {
        if let Some(message) = store.load(id).await? {
            let h = &message.header;
            println!(
                "{}  {}  {:<12}  {:<8}  {} -> {}",
                h.message_id,
                h.timestamp.to_rfc3339(),
                h.message_type.to_string(),
                h.priority.to_string(),
                h.source,
                h.target
            );
        }
    }
    println!("{} pending message(s)", ids.len());
    Ok(())
}

// ============================================================================
// Demo
// ============================================================================

struct Echo;

#[async_trait]
impl AgentBehavior for Echo {
    async fn handle_command(&self, message: Message) -> agent_bus::Result<Option<Message>> {
        let params = message
            .as_command()
            .map(|c| c.parameters.clone())
            .unwrap_or_default();
        Ok(Some(message.create_response(true, "echoed", params)))
    }
}

struct Coordinator;

#[async_trait]
impl AgentBehavior for Coordinator {
    async fn handle_command(&self, message: Message) -> agent_bus::Result<Option<Message>> {
        let action = message
            .as_command()
            .map(|c| c.action.clone())
            .unwrap_or_default();
        Err(agent_bus::Error::unknown_action(action))
    }
}

struct Prepare;

#[async_trait]
impl WorkflowState for Prepare {
    async fn process(&self, data: &mut WorkflowData) -> agent_bus::Result<TransitionResult> {
        data.context.insert("prepared".into(), json!(true));
        Ok(TransitionResult::to("deliver"))
    }
}

struct Deliver;

#[async_trait]
impl WorkflowState for Deliver {
    async fn process(&self, data: &mut WorkflowData) -> agent_bus::Result<TransitionResult> {
        data.context.insert("delivered".into(), json!(true));
        Ok(TransitionResult::stay())
    }
}

async fn cmd_demo(settings: Settings, timeout: Duration) -> anyhow::Result<()> {
    let bus = MessageBus::open(BusConfig::from_settings(&settings)).await?;
    bus.start().await?;

    let agent_config = AgentConfig::from_settings(&settings);
    let echo = BusAgent::new("echo", "Echo", Echo, bus.clone(), agent_config.clone());
    let coordinator = BusAgent::new(
        "coordinator",
        "Coordinator",
        Coordinator,
        bus.clone(),
        agent_config.clone(),
    );
    echo.start().await?;
    coordinator.start().await?;

    let options = CommandOptions::from_config(&agent_config)
        .with_priority(Priority::High)
        .with_response_timeout(timeout);
    let reply = coordinator
        .send_command("echo", "echo", json!({"greeting": "hello"}), options)
        .await?;
    match reply {
        Some(r) => println!("echo replied: {}", serde_json::to_string(&r.body)?),
        None => println!("echo did not reply"),
    }

    let manager = WorkflowManager::new(bus.clone());
    let workflow = manager.create_workflow("demo", coordinator.agent_id()).await;
    workflow.add_state("prepare", Prepare).add_state("deliver", Deliver);
    workflow.start("prepare", None).await?;
    if !workflow.wait_for_state("deliver", timeout).await {
        warn!(workflow_id = %workflow.id(), "Workflow did not reach 'deliver' in time");
    }
    workflow.stop("demo_finished").await;

    let data = workflow.data().await;
    for entry in &data.history {
        println!(
            "workflow {}: {} -> {} ({})",
            workflow.id(),
            entry.from_state.as_deref().unwrap_or("-"),
            entry.to_state.as_deref().unwrap_or("-"),
            entry.reason
        );
    }

    echo.stop().await?;
    coordinator.stop().await?;
    let metrics = bus.get_metrics().await;
    bus.stop().await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
