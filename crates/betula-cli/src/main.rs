//! Betula demo driver.
//!
//! Runs a tree against a backing directory in one of two modes. `test`
//! mirrors a random (or scripted) mix of operations against an in-memory
//! reference map and asserts that every query and scan agrees;
//! `benchmark` issues random updates. Runs can be recorded to a script
//! and replayed.

mod script;

use anyhow::{bail, ensure, Context, Result};
use betula_cache::LruCacheManager;
use betula_store::{FileStore, FileStoreConfig};
use betula_tree::{Betree, Cursor, TreeConfig};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use script::Command;
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Bound;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backing store directory
    #[arg(short = 'd', long)]
    dir: PathBuf,

    /// Run mode
    #[arg(short = 'm', long)]
    mode: Mode,

    /// Maximum node size, in messages
    #[arg(short = 'N', long, default_value_t = 16)]
    max_node_size: u64,

    /// Minimum flush size, in messages
    #[arg(short = 'f', long, default_value_t = 4)]
    min_flush_size: u64,

    /// Cache size, in tree nodes
    #[arg(short = 'C', long, default_value_t = 4)]
    cache_size: usize,

    /// Number of distinct keys
    #[arg(short = 'k', long, default_value_t = 1024)]
    distinct_keys: u64,

    /// Number of operations
    #[arg(short = 't', long, default_value_t = 4096)]
    operations: u64,

    /// Random seed
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Replay operations from a script file
    #[arg(short = 'i', long)]
    replay: Option<PathBuf>,

    /// Record operations to a script file
    #[arg(short = 'o', long)]
    record: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Test,
    Benchmark,
}

type Tree = Betree<u64, String>;
type Reference = BTreeMap<u64, String>;

fn value_for(key: u64) -> String {
    format!("{key}:")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if cli.mode == Mode::Benchmark && (cli.replay.is_some() || cli.record.is_some()) {
        bail!("scripts cannot be used in benchmark mode");
    }

    let seed = cli.seed.unwrap_or_else(rand::random);
    tracing::info!(seed, mode = ?cli.mode, "starting");

    let store = FileStore::open(FileStoreConfig {
        dir: cli.dir.clone(),
        fsync_enabled: true,
    })?;
    let mut tree: Tree = Betree::open(
        Box::new(store),
        Box::new(LruCacheManager::new(cli.cache_size)),
        TreeConfig {
            max_node_size: cli.max_node_size,
            min_flush_size: cli.min_flush_size,
        },
    )?;

    match cli.mode {
        Mode::Test => test(&cli, &mut tree, seed)?,
        Mode::Benchmark => benchmark(&cli, &mut tree, seed)?,
    }

    tree.checkpoint()?;
    Ok(())
}

fn test(cli: &Cli, tree: &mut Tree, seed: u64) -> Result<()> {
    let mut reference = Reference::new();
    let mut rng = StdRng::seed_from_u64(seed);

    let replay: Option<Vec<Command>> = match &cli.replay {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading script {}", path.display()))?;
            Some(script::parse_script(&text)?)
        }
        None => None,
    };
    let mut record = match &cli.record {
        Some(path) => Some(
            std::fs::File::create(path)
                .with_context(|| format!("creating script {}", path.display()))?,
        ),
        None => None,
    };

    for i in 0..cli.operations as usize {
        let command = match &replay {
            Some(commands) => {
                let Some(command) = commands.get(i) else {
                    break; // script exhausted
                };
                command.clone()
            }
            None => {
                let key = rng.gen_range(0..cli.distinct_keys);
                match rng.gen_range(0..7) {
                    0 => Command::Insert(key),
                    1 => Command::Update(key),
                    2 => Command::Delete(key),
                    3 => Command::Query(key, None),
                    4 => Command::FullScan,
                    5 => Command::LowerBoundScan(key),
                    _ => Command::UpperBoundScan(key),
                }
            }
        };

        let executed = execute(tree, &mut reference, &command)?;
        if let Some(out) = &mut record {
            writeln!(out, "{}", executed.render())?;
        }
    }

    println!("Test PASSED");
    Ok(())
}

/// Applies one command to both the tree and the reference, checking that
/// they agree. Returns the command with its observed outcome filled in,
/// ready for recording.
fn execute(tree: &mut Tree, reference: &mut Reference, command: &Command) -> Result<Command> {
    match command {
        Command::Insert(key) => {
            tree.insert(*key, value_for(*key))?;
            reference.insert(*key, value_for(*key));
        }
        Command::Update(key) => {
            tree.update(*key, value_for(*key))?;
            reference
                .entry(*key)
                .and_modify(|v| v.push_str(&value_for(*key)))
                .or_insert_with(|| value_for(*key));
        }
        Command::Delete(key) => {
            tree.erase(*key)?;
            reference.remove(key);
        }
        Command::Query(key, _) => {
            let found = tree.query(key)?;
            ensure!(
                found == reference.get(key).cloned(),
                "query {key}: tree found {found:?}, reference {:?}",
                reference.get(key)
            );
            return Ok(Command::Query(*key, found));
        }
        Command::FullScan => {
            verify_scan(tree.begin()?, reference.iter())?;
        }
        Command::LowerBoundScan(key) => {
            verify_scan(tree.lower_bound(key)?, reference.range(*key..))?;
        }
        Command::UpperBoundScan(key) => {
            verify_scan(
                tree.upper_bound(key)?,
                reference.range((Bound::Excluded(*key), Bound::Unbounded)),
            )?;
        }
    }
    Ok(command.clone())
}

fn verify_scan<'a>(
    mut cursor: Cursor<'_, u64, String>,
    expected: impl Iterator<Item = (&'a u64, &'a String)>,
) -> Result<()> {
    for (key, value) in expected {
        let got = cursor
            .next()
            .context("tree scan ended before the reference")??;
        ensure!(
            got.0 == *key && &got.1 == value,
            "scan mismatch: tree {got:?}, reference ({key}, {value:?})"
        );
    }
    ensure!(cursor.next().is_none(), "tree scan has extra entries");
    Ok(())
}

fn benchmark(cli: &Cli, tree: &mut Tree, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let started = std::time::Instant::now();
    for _ in 0..cli.operations {
        let key = rng.gen_range(0..cli.distinct_keys);
        tree.update(key, value_for(key))?;
    }
    let elapsed = started.elapsed();
    tracing::info!(
        operations = cli.operations,
        elapsed_ms = elapsed.as_millis() as u64,
        "benchmark complete"
    );
    println!(
        "{} updates in {:.3}s",
        cli.operations,
        elapsed.as_secs_f64()
    );
    Ok(())
}
