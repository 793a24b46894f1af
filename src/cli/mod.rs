pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use self::config::EngineConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new crawl task
    Create {
        /// Task name
        #[arg(short, long)]
        name: String,

        /// Target URL
        #[arg(short, long)]
        url: String,

        /// Task type (api, web)
        #[arg(short = 't', long = "type", default_value = "api")]
        task_type: String,

        /// Use the resumable paginated search crawler
        #[arg(short, long)]
        paginated: bool,

        /// Extra request header as name=value (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,
    },

    /// List tasks
    Tasks {
        #[arg(short, long, default_value_t = 50)]
        limit: i64,

        #[arg(short, long, default_value_t = 0)]
        offset: i64,
    },

    /// Run a task until it finishes. Ctrl-C pauses it.
    Start {
        /// Task ID
        #[arg(required = true)]
        task_id: i64,

        /// Resume a paused or stopped task from its cursor
        #[arg(short, long)]
        resume: bool,
    },

    /// Pause tasks left running by a crawler process that died.
    /// Only use while no other crawler process is running.
    Recover,

    /// Manage proxies
    Proxies {
        #[command(subcommand)]
        action: ProxyAction,
    },

    /// Manage search payload overrides
    Overrides {
        #[command(subcommand)]
        action: OverridesAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ProxyAction {
    /// List all proxies
    List,

    /// Register a proxy
    Add {
        host: String,
        port: u16,

        /// Proxy type (http, https, socks5)
        #[arg(short = 't', long = "type", default_value = "http")]
        proxy_type: String,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Health check every active proxy once
    Check,
}

#[derive(Subcommand)]
enum OverridesAction {
    /// Print the current overrides
    Show,

    /// Replace the overrides with the JSON object in FILE
    Set { file: PathBuf },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

impl Cli {
    /// `config init` must work before a valid configuration exists
    pub fn needs_config(&self) -> bool {
        !matches!(
            self.command,
            Commands::Config {
                action: ConfigAction::Init { .. }
            }
        )
    }
}

/// Process the command
pub async fn process_command(cli: Cli, config: EngineConfig) -> Result<()> {
    match cli.command {
        Commands::Create { name, url, task_type, paginated, headers } => {
            info!("Creating task {} for {}", name, url);
            commands::create_task(&config, name, url, task_type, paginated, headers).await
        }
        Commands::Tasks { limit, offset } => commands::list_tasks(&config, limit, offset).await,
        Commands::Start { task_id, resume } => {
            info!("Starting task {}", task_id);
            commands::start(&config, task_id, resume).await
        }
        Commands::Recover => commands::recover(&config).await,
        Commands::Proxies { action } => match action {
            ProxyAction::List => commands::list_proxies(&config).await,
            ProxyAction::Add { host, port, proxy_type, username, password } => {
                commands::add_proxy(&config, host, port, proxy_type, username, password).await
            }
            ProxyAction::Check => commands::check_proxies(&config).await,
        },
        Commands::Overrides { action } => match action {
            OverridesAction::Show => commands::show_overrides(&config).await,
            OverridesAction::Set { file } => commands::set_overrides(&config, &file).await,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::show_config(&config),
            ConfigAction::Init { force } => commands::init_config(cli.config.as_deref(), force),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["crawler", "start", "7", "--resume", "-v", "--config", "engine.yaml"]).unwrap();

        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("engine.yaml")));
        assert!(matches!(cli.command, Commands::Start { task_id: 7, resume: true }));
    }

    #[test]
    fn config_init_does_not_need_a_config() {
        let cli = Cli::try_parse_from(["crawler", "config", "init"]).unwrap();
        assert!(!cli.needs_config());

        let cli = Cli::try_parse_from(["crawler", "tasks"]).unwrap();
        assert!(cli.needs_config());

        let cli = Cli::try_parse_from(["crawler", "recover"]).unwrap();
        assert!(matches!(cli.command, Commands::Recover));
    }
}
