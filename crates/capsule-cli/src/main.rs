mod commands;

use capsule_schema::{parse_conf_file, ConfError, RuntimeConf, DEFAULT_CONF_PATH};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::launch::{LaunchArgs, Target};
use commands::Failure;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(
    name = "capsule",
    version,
    about = "Run programs inside container images"
)]
struct Cli {
    /// Runtime configuration file (default: $CAPSULE_CONF or /etc/capsule/capsule.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

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
    /// Run a command inside a container image.
    Exec {
        #[command(flatten)]
        launch: LaunchArgs,
        /// Image path or instance://name.
        image: String,
        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run the image's runscript.
    Run {
        #[command(flatten)]
        launch: LaunchArgs,
        /// Image path or instance://name.
        image: String,
        /// Arguments passed to the runscript.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Start an interactive shell inside a container image.
    Shell {
        #[command(flatten)]
        launch: LaunchArgs,
        /// Image path or instance://name.
        image: String,
    },
    /// Manage background instances.
    Instance {
        #[command(subcommand)]
        command: InstanceCommands,
    },
    /// Run diagnostic checks on the host and configuration.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum InstanceCommands {
    /// Start a named instance of an image in the background.
    Start {
        #[command(flatten)]
        launch: LaunchArgs,
        /// Image path.
        image: String,
        /// Instance name.
        name: String,
        /// Arguments passed to the image's startscript.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List running instances.
    List,
    /// Stop a running instance.
    Stop {
        /// Instance name.
        name: String,
        /// Send SIGKILL instead of SIGTERM.
        #[arg(short, long, default_value_t = false)]
        force: bool,
    },
}

fn conf_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path
        .or_else(|| std::env::var_os("CAPSULE_CONF").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_PATH))
}

/// A missing configuration file means defaults; a broken one is an error.
fn load_conf(path: &Path) -> Result<RuntimeConf, ConfError> {
    if !path.exists() {
        warn!(
            "configuration file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(RuntimeConf::default());
    }
    parse_conf_file(path)
}

fn with_conf(
    path: &Path,
    f: impl FnOnce(&RuntimeConf) -> Result<u8, Failure>,
) -> Result<u8, Failure> {
    let conf = load_conf(path)?;
    f(&conf)
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
            tracing_subscriber::EnvFilter::try_from_env("CAPSULE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let conf_path = conf_path(cli.config);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Exec {
            launch,
            image,
            command,
        } => with_conf(&conf_path, |conf| {
            commands::launch::run(conf, launch, &image, Target::Exec(command))
        }),
        Commands::Run {
            launch,
            image,
            args,
        } => with_conf(&conf_path, |conf| {
            commands::launch::run(conf, launch, &image, Target::Run(args))
        }),
        Commands::Shell { launch, image } => with_conf(&conf_path, |conf| {
            commands::launch::run(conf, launch, &image, Target::Shell)
        }),
        Commands::Instance { command } => match command {
            InstanceCommands::Start {
                launch,
                image,
                name,
                args,
            } => with_conf(&conf_path, |conf| {
                commands::instance::start(conf, launch, &image, &name, &args, json_output)
            }),
            InstanceCommands::List => {
                with_conf(&conf_path, |conf| commands::instance::list(conf, json_output))
            }
            InstanceCommands::Stop { name, force } => with_conf(&conf_path, |conf| {
                commands::instance::stop(conf, &name, force, json_output)
            }),
        },
        Commands::Doctor => commands::doctor::run(&conf_path, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {}", failure.message);
            ExitCode::from(failure.code)
        }
    }
}
