use clap::{command, Parser, Subcommand};
use stackstate::{
    cas::{
        codec::CasProtocolCodec, connection::ProcessConnection, keyval::KeyVal,
        statement::SecurityLevel,
    },
    config::StackStateConfig,
    state::scan_state_references,
    Error, InternalResult,
};
use std::{
    io::{self, Read},
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, default_value = "stackstate.json", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the engine program for a block of author text
    Encode(SourceArgs),

    /// Parse raw engine output and print it as JSON
    Decode {
        /// File with the engine output, `-` for stdin
        #[arg(default_value = "-")]
        output: PathBuf,
    },

    /// List the state declarations of a block of author text
    Scan {
        /// File with the author text, `-` for stdin
        #[arg(default_value = "-")]
        source: PathBuf,
    },

    /// Evaluate a block of author text on the configured engine
    Run(SourceArgs),
}

#[derive(Parser)]
struct SourceArgs {
    /// File with the author text, `-` for stdin
    #[arg(default_value = "-")]
    source: PathBuf,

    /// Random seed for the session
    #[arg(short, long, default_value = "1")]
    seed: i64,
}

fn read_input(path: &Path) -> InternalResult<String> {
    if path == Path::new("-") {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| Error::internal(format!("Failed to read stdin: {}", e)))?;
        return Ok(input);
    }
    std::fs::read_to_string(path)
        .map_err(|e| Error::internal(format!("Failed to read {}: {}", path.display(), e)))
}

fn load_config(path: &Path) -> InternalResult<StackStateConfig> {
    if path.exists() {
        stackstate::config::from_file(path)
    } else {
        Ok(StackStateConfig::default())
    }
}

fn author_text(path: &Path) -> InternalResult<KeyVal> {
    let keyval = KeyVal::new(read_input(path)?, "cli", SecurityLevel::Teacher);
    match keyval.errors().first() {
        Some(error) => Err(error.clone().into()),
        None => Ok(keyval),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> InternalResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::internal(format!("Failed to serialize output: {}", e)))
}

async fn run(cli: &Cli) -> InternalResult<bool> {
    let config = load_config(&cli.config)?;
    debug!("config: {:?}", config);

    match &cli.command {
        Commands::Encode(args) => {
            let keyval = author_text(&args.source)?;
            println!(
                "{}",
                CasProtocolCodec::encode(keyval.statements(), &config.options, args.seed)
            );
            Ok(true)
        }
        Commands::Decode { output } => {
            let decoded = CasProtocolCodec::decode(&read_input(output)?)?;
            println!("{}", to_json(&decoded)?);
            Ok(true)
        }
        Commands::Scan { source } => {
            let references = scan_state_references(&read_input(source)?);
            println!("{}", to_json(&references)?);
            Ok(references.errors.is_empty())
        }
        Commands::Run(args) => {
            let keyval = author_text(&args.source)?;
            let connection = ProcessConnection::new(&config.engine);
            let mut session = keyval.session(&config.options, args.seed);
            session.instantiate(&connection).await?;
            info!(
                "Engine {} answered session {}",
                session.engine_version().unwrap_or("unknown"),
                session.id()
            );

            let mut ok = !session.timed_out();
            for statement in session.statements() {
                for error in statement.errors() {
                    ok = false;
                    eprintln!("{}: {}", statement.context(), error);
                }
            }
            for key in session.get_all_keys() {
                println!("{} = {}", key, session.get_value_text(key).unwrap_or(""));
            }
            Ok(ok)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
