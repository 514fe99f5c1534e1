//! chatfolders: inspect and maintain a persisted group store.
//!
//! Usage:
//!   chatfolders [--store <path>] list          # Groups and their chats
//!   chatfolders [--store <path>] last-active   # Path -> group map
//!   chatfolders [--store <path>] seed          # Seed presets if never seeded
//!   chatfolders [--store <path>] prune-history # Drop stale last-active entries

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};

use chatfolders::config::Config;
use chatfolders::groups::{GroupRegistry, LastActive};
use chatfolders::logging::init_logging;
use chatfolders::store::{FlushOutcome, JsonFileStore, PersistentStore, WriteScheduler};

fn print_usage() {
    println!("chatfolders: inspect a persisted group store");
    println!();
    println!("Usage:");
    println!("  chatfolders [--store <path>] list           List groups and their chats");
    println!("  chatfolders [--store <path>] last-active    Show the last-active map");
    println!("  chatfolders [--store <path>] seed           Seed preset groups once");
    println!("  chatfolders [--store <path>] prune-history  Drop stale last-active entries");
}

/// Parsed command line. `None` from [`parse_args`] means help was printed.
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    store_path: Option<PathBuf>,
    command: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Args>> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--store" => {
                let path = args.next().context("--store needs a path")?;
                parsed.store_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other if parsed.command.is_none() => parsed.command = Some(other.to_string()),
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(Some(parsed))
}

fn main() -> Result<()> {
    let Some(Args {
        store_path,
        command,
    }) = parse_args(std::env::args().skip(1))?
    else {
        return Ok(());
    };

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config.log).context("Failed to initialize logging")?;

    let mut store = match store_path {
        Some(path) => JsonFileStore::open(path)?,
        None => JsonFileStore::open_default()?,
    };

    match command.as_deref() {
        Some("list") | None => list(&config, &store),
        Some("last-active") => last_active(&config, &store),
        Some("seed") => seed(&config, &mut store),
        Some("prune-history") => prune_history(&config, &mut store),
        Some(other) => bail!("Unknown command: {}", other),
    }
}

/// Load without seeding, so maintenance never writes the seeding flag
fn load(config: &Config, store: &dyn PersistentStore) -> GroupRegistry {
    let mut registry = GroupRegistry::new(WriteScheduler::new(config.engine.write_policy()));
    registry.load_existing(store);
    registry
}

fn list(config: &Config, store: &JsonFileStore) -> Result<()> {
    let registry = load(config, store);
    if registry.is_empty() {
        println!("No groups");
        return Ok(());
    }
    for group in registry.groups_in_order() {
        let flags = match (group.collapsed, group.prompt.is_empty()) {
            (true, false) => " [collapsed, prompt]",
            (true, true) => " [collapsed]",
            (false, false) => " [prompt]",
            (false, true) => "",
        };
        println!("{} ({}){} - {} chat(s)", group.name, group.id, flags, group.chats.len());
        for chat in &group.chats {
            let pin = if chat.pinned { "*" } else { " " };
            println!("  {} {:<40} {}", pin, chat.url, chat.title);
        }
    }
    Ok(())
}

fn last_active(config: &Config, store: &JsonFileStore) -> Result<()> {
    let registry = load(config, store);
    let map = registry.last_active_map();
    if map.is_empty() {
        println!("No last-active entries");
        return Ok(());
    }
    for (path, value) in map {
        let target = match value {
            LastActive::History => "history".to_string(),
            LastActive::Group(id) => match registry.group(id) {
                Some(group) => format!("{} ({})", group.name, id),
                None => format!("{} (missing)", id),
            },
        };
        println!("{:<40} {}", path, target);
    }
    Ok(())
}

fn seed(config: &Config, store: &mut JsonFileStore) -> Result<()> {
    let mut registry = GroupRegistry::new(WriteScheduler::new(config.engine.write_policy()));
    let report = registry.load(&*store, &config.engine.presets);
    if !report.seeded {
        println!("Presets already seeded");
        return Ok(());
    }
    flush(&mut registry, store)?;
    println!("Seeded {} preset group(s)", config.engine.presets.len());
    Ok(())
}

fn prune_history(config: &Config, store: &mut JsonFileStore) -> Result<()> {
    let mut registry = load(config, &*store);
    let keep: Vec<String> = registry
        .last_active_map()
        .iter()
        .filter(|(path, value)| match value {
            LastActive::Group(id) => registry.group_contains(id, path),
            LastActive::History => true,
        })
        .map(|(path, _)| path.clone())
        .collect();
    let removed = registry.prune_last_active(|path| keep.iter().any(|k| k == path));
    if removed > 0 {
        flush(&mut registry, store)?;
    }
    println!("Removed {} stale entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}

fn flush(registry: &mut GroupRegistry, store: &mut JsonFileStore) -> Result<()> {
    match registry.flush_now(Instant::now(), store) {
        Some(FlushOutcome::Written { .. }) | None => Ok(()),
        Some(other) => bail!("Store write did not complete: {:?}", other),
    }
}
