//! AtlasCab CLI
//!
//! Runs one command against a snapshot-backed database and writes the
//! snapshot back on exit.

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use atlascab::{AtlasError, Config, Database, EventLoop, OpenMode, RequestId, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasCab CLI
#[derive(Parser, Debug)]
#[command(name = "atlascab")]
#[command(about = "Asynchronous key-value store with consistent secondary indexes")]
#[command(version)]
struct Args {
    /// Snapshot file ("+" for a throwaway in-memory store)
    #[arg(short, long, default_value = "atlascab.snap")]
    db: String,

    /// Open mode: r, r+, w+ or a+
    #[arg(short, long, default_value = "a+")]
    mode: String,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get { key: String },

    /// Set a key-value pair
    Set { key: String, value: String },

    /// Add a key-value pair, failing if the key exists
    Add { key: String, value: String },

    /// Remove a key
    Remove { key: String },

    /// Add to an integer counter
    Incr {
        key: String,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
        /// Seed for an absent key
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        initial: i64,
    },

    /// Compare and swap (omit --old to require absence, --new to remove)
    Cas {
        key: String,
        #[arg(long)]
        old: Option<String>,
        #[arg(long)]
        new: Option<String>,
    },

    /// List keys with a prefix
    Prefix {
        prefix: String,
        /// Max keys (negative = all)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        max: i64,
    },

    /// List keys matching a regular expression
    Regex {
        pattern: String,
        /// Max keys (negative = all)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        max: i64,
    },

    /// Print every record
    List,

    /// Print the number of records
    Count,

    /// Print store status
    Status,
}

fn main() {
    // Logs go to stderr so command output stays clean
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,atlascab=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("AtlasCab v{}", atlascab::VERSION);

    let code = match run(args) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            e.kind().code()
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<()> {
    let mode: OpenMode = args.mode.parse()?;
    let mut builder = Config::builder().path(&args.db).open_mode(mode);
    if let Some(workers) = args.workers {
        builder = builder.worker_threads(workers);
    }
    let config = builder.build();

    let event_loop = EventLoop::new(config.clone())?;
    let db = Database::new(&event_loop);
    wait(&event_loop, |done| db.open_with(&config, done))?;

    let outcome = execute(&event_loop, &db, args.command);
    let closed = wait(&event_loop, |done| db.close(done));
    outcome?;
    closed
}

/// Submit one request and run the loop until it is delivered
fn wait<T, S>(event_loop: &EventLoop, submit: S) -> Result<T>
where
    T: 'static,
    S: FnOnce(Box<dyn FnOnce(Result<T>)>) -> Result<RequestId>,
{
    let slot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    submit(Box::new(move |result| *sink.borrow_mut() = Some(result)))?;
    event_loop.run();

    let delivered = slot.borrow_mut().take();
    delivered.unwrap_or(Err(AtlasError::Disconnected))
}

fn show(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn print_keys(keys: &[Bytes]) {
    for key in keys {
        println!("{}", show(key));
    }
}

fn execute(event_loop: &EventLoop, db: &Database, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key } => match wait(event_loop, |done| db.get(&key, done))? {
            Some(value) => println!("{}", show(&value)),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            wait(event_loop, |done| db.set(&key, &value, done))?;
            println!("OK");
        }
        Commands::Add { key, value } => {
            wait(event_loop, |done| db.add(&key, &value, done))?;
            println!("OK");
        }
        Commands::Remove { key } => {
            wait(event_loop, |done| db.remove(&key, done))?;
            println!("OK");
        }
        Commands::Incr {
            key,
            delta,
            initial,
        } => {
            let n = wait(event_loop, |done| db.increment(&key, delta, initial, done))?;
            println!("{}", n);
        }
        Commands::Cas { key, old, new } => {
            let swapped = wait(event_loop, |done| {
                db.compare_and_swap(
                    &key,
                    old.as_deref().map(str::as_bytes),
                    new.as_deref().map(str::as_bytes),
                    done,
                )
            })?;
            println!("{}", swapped);
        }
        Commands::Prefix { prefix, max } => {
            let keys = wait(event_loop, |done| db.match_prefix(&prefix, max, done))?;
            print_keys(&keys);
        }
        Commands::Regex { pattern, max } => {
            let keys = wait(event_loop, |done| db.match_regex(&pattern, max, done))?;
            print_keys(&keys);
        }
        Commands::List => {
            wait(event_loop, |done| {
                db.each(
                    |key, value| {
                        println!("{}\t{}", show(key), show(value));
                        ControlFlow::Continue(())
                    },
                    done,
                )
            })?;
        }
        Commands::Count => {
            let n = wait(event_loop, |done| db.count(done))?;
            println!("{}", n);
        }
        Commands::Status => {
            let status = wait(event_loop, |done| db.status(done))?;
            for (name, value) in status {
                println!("{}: {}", name, value);
            }
        }
    }
    Ok(())
}
