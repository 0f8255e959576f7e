use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kvbtree::{Database, Error, DEFAULT_PAGE_SIZE};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "kvbtree", version = VERSION, about = "Persistent B-tree key/value store.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Creates a new, empty database file.
    Create {
        path: PathBuf,
        /// Total size of the page file, in bytes.
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        size: u64,
    },
    /// Inserts or overwrites a key's value.
    Insert {
        path: PathBuf,
        key: String,
        value: String,
    },
    /// Looks up a key's value.
    Get { path: PathBuf, key: String },
    /// Deletes a key.
    Delete { path: PathBuf, key: String },
    /// Writes a human-readable tree dump to stderr.
    Dump { path: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Create { path, size } => {
            let size = size.max(DEFAULT_PAGE_SIZE as u64 * 8);
            Database::create(path, size)?.close()?;
        }
        Command::Insert { path, key, value } => {
            let db = Database::open(path)?;
            db.insert(key.as_bytes(), value.as_bytes())?;
            db.close()?;
        }
        Command::Get { path, key } => {
            let db = Database::open(path)?;
            match db.search(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => eprintln!("key not found"),
            }
        }
        Command::Delete { path, key } => {
            let db = Database::open(path)?;
            db.delete(key.as_bytes())?;
            db.close()?;
        }
        Command::Dump { path } => {
            let db = Database::open(path)?;
            db.debug_dump()?;
        }
    }
    Ok(())
}
