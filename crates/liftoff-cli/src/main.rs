mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::unlock::Target;
use commands::{exit_code, EXIT_FAILURE};
use liftoff_core::{install_signal_handler, CoreError};
use liftoff_schema::{EnvironmentType, Provider, ProviderConfig, CONFIG_FILE_NAME};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "liftoff",
    version,
    about = "Lock-protected provisioning and deployment orchestration"
)]
struct Cli {
    /// Path to the project configuration.
    #[arg(short, long, default_value = CONFIG_FILE_NAME, global = true)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create, delete, and list environments.
    #[command(subcommand)]
    Env(EnvCommand),
    /// Create or destroy resources in an environment.
    #[command(subcommand)]
    Resource(ResourceCommand),
    /// Show an environment with its resources, services, and lock.
    Inspect {
        /// Environment name.
        environment: String,
    },
    /// Force-release a lock left behind by a terminated process.
    Unlock {
        /// Environment name.
        environment: String,
        /// Release the lock of this resource instead of the environment lock.
        #[arg(long, conflicts_with = "service")]
        resource: Option<String>,
        /// Release the lock of this service instead of the environment lock.
        #[arg(long)]
        service: Option<String>,
        /// Do not ask for confirmation.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum EnvCommand {
    /// Register an environment and provision its environment-level product.
    Create {
        /// Environment name.
        name: String,
        #[arg(long = "type", value_enum, default_value_t = EnvTypeArg::Development)]
        env_type: EnvTypeArg,
        #[arg(long, value_enum)]
        provider: ProviderArg,
        /// GCP project id or AWS account id.
        #[arg(long)]
        account_id: String,
        #[arg(long)]
        region: String,
        /// Service account email or role ARN that workloads run as.
        #[arg(long)]
        identity: String,
        /// Bucket holding staged sources and cached outputs.
        #[arg(long)]
        artifact_bucket: String,
    },
    /// Delete an environment that has no resources or services left.
    Delete {
        /// Environment name.
        name: String,
        /// Do not ask for confirmation.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
    /// List the project's environments.
    List,
}

#[derive(Debug, Subcommand)]
enum ResourceCommand {
    /// Apply resources (all when none are named) and everything they depend on.
    Create {
        /// Environment name.
        environment: String,
        /// Resource names.
        names: Vec<String>,
        /// Resources applied at once (defaults to settings.concurrency).
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Destroy a resource no other unit depends on.
    Destroy {
        /// Environment name.
        environment: String,
        /// Resource name.
        name: String,
        /// Do not ask for confirmation.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Gcp,
    Aws,
}

impl From<ProviderArg> for Provider {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Gcp => Provider::Gcp,
            ProviderArg::Aws => Provider::Aws,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EnvTypeArg {
    Development,
    Production,
}

impl From<EnvTypeArg> for EnvironmentType {
    fn from(arg: EnvTypeArg) -> Self {
        match arg {
            EnvTypeArg::Development => EnvironmentType::Development,
            EnvTypeArg::Production => EnvironmentType::Production,
        }
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LIFTOFF_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    if let Commands::Completions { shell } = cli.command {
        return ExitCode::from(commands::completions::run::<Cli>(shell));
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let result = runtime.block_on(run(cli));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            if let Some(log) = e.log_ref() {
                eprintln!("log: {log}");
            }
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<u8, CoreError> {
    let json = cli.json;
    let ctx = commands::open_context(&cli.config)?;
    install_signal_handler(ctx.cancel_token().clone());
    match cli.command {
        Commands::Env(EnvCommand::Create {
            name,
            env_type,
            provider,
            account_id,
            region,
            identity,
            artifact_bucket,
        }) => {
            let provider_config = ProviderConfig {
                provider: provider.into(),
                account_id,
                region,
                identity,
                artifact_bucket,
            };
            commands::env::create(&ctx, &name, env_type.into(), provider_config, json).await
        }
        Commands::Env(EnvCommand::Delete { name, yes }) => {
            commands::env::delete(&ctx, &name, yes, json).await
        }
        Commands::Env(EnvCommand::List) => commands::env::list(&ctx, json).await,
        Commands::Resource(ResourceCommand::Create {
            environment,
            names,
            concurrency,
        }) => commands::resource::create(&ctx, &environment, &names, concurrency, json).await,
        Commands::Resource(ResourceCommand::Destroy {
            environment,
            name,
            yes,
        }) => commands::resource::destroy(&ctx, &environment, &name, yes, json).await,
        Commands::Inspect { environment } => {
            commands::inspect::run(&ctx, &environment, json).await
        }
        Commands::Unlock {
            environment,
            resource,
            service,
            yes,
        } => {
            let target = match (resource, service) {
                (Some(name), _) => Target::Resource(name),
                (None, Some(name)) => Target::Service(name),
                (None, None) => Target::Environment,
            };
            commands::unlock::run(&ctx, &environment, target, yes, json).await
        }
        Commands::Completions { .. } => Ok(commands::EXIT_SUCCESS),
    }
}
