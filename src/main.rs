//! unistore CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use unistore::commands::{self, Globals};

#[derive(Parser, Debug)]
#[command(name = "unistore")]
#[command(version, about = "Key-value and list stores over pluggable backends")]
struct Cli {
    /// Root for relative descriptor and database paths
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// SQLite file for the `default` SQL connector [default: <root>/data/stores.db]
    #[arg(long, global = true, value_name = "PATH")]
    sqlite: Option<PathBuf>,

    /// Redis URL registered as the `redis` cache connector
    #[cfg(feature = "redis")]
    #[arg(long, global = true, value_name = "URL")]
    redis: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate every store descriptor in a directory
    Validate {
        /// Directory of .json/.toml descriptors
        dir: PathBuf,
    },
    /// Run one stores.<name>.<Method> process
    Call {
        /// Directory of store descriptors to load
        #[arg(short, long, default_value = "stores")]
        stores: PathBuf,
        /// Process name, e.g. stores.cache.Get
        process: String,
        /// Arguments; each is parsed as JSON, falling back to a string
        args: Vec<String>,
    },
    /// Run a JavaScript file with `new Store(name)` available
    Script {
        /// Directory of store descriptors to load
        #[arg(short, long, default_value = "stores")]
        stores: PathBuf,
        /// Script exporting `default function(input)`
        file: PathBuf,
        /// JSON passed to the script as `input`
        #[arg(short, long)]
        input: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

/// Logs go to stderr so stdout carries only results.
fn init_logging(format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let globals = Globals {
        root: cli.root,
        sqlite: cli.sqlite,
        #[cfg(feature = "redis")]
        redis: cli.redis,
    };

    match cli.command {
        Commands::Validate { dir } => commands::validate::execute(&dir),
        Commands::Call {
            stores,
            process,
            args,
        } => commands::call::execute(&globals, &stores, &process, &args).await,
        Commands::Script {
            stores,
            file,
            input,
        } => commands::script::execute(&globals, &stores, &file, input.as_deref()).await,
    }
}
