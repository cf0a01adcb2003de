//! Custom list management
//!
//! Edits the user-managed whitelist/blocklist entries in the data dir. A
//! running proxy picks them up on its next restart or successful list refresh.

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use wshield_core::filter::normalize_host;
use wshield_core::lists::SourceStatus;
use wshield_core::{Config, ListKind, ListStore};

/// Where the lists live
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    /// Configuration file (default: detect)
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Data directory override
    #[arg(short = 'd', long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

impl StoreArgs {
    /// Load the config and open the persisted lists
    pub fn open(&self) -> Result<(Config, std::sync::Arc<ListStore>)> {
        let config = super::load_config(self.config.as_deref(), None)?;
        let dir = super::data_dir(&config, self.data_dir.as_deref())?;
        let store = super::offline_store(&config, &dir)?;
        Ok((config, store))
    }
}

/// List selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListArg {
    /// Blocked domains
    Blocklist,
    /// Domains that bypass every other rule
    Whitelist,
}

impl ListArg {
    /// The core list kind
    pub fn kind(self) -> ListKind {
        match self {
            ListArg::Blocklist => ListKind::Blocklist,
            ListArg::Whitelist => ListKind::Whitelist,
        }
    }
}

/// Filter management arguments
#[derive(Args, Debug)]
pub struct FilterArgs {
    #[command(subcommand)]
    pub command: FilterCommands,
}

/// Filter subcommands
#[derive(Subcommand, Debug)]
pub enum FilterCommands {
    /// Show custom entries and source status
    List {
        /// Only this list
        #[arg(short, long, value_enum)]
        list: Option<ListArg>,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Add a custom entry (example.com, *.example.com or a CIDR)
    Add {
        /// Pattern to add
        pattern: String,

        /// Target list
        #[arg(short, long, value_enum, default_value = "blocklist")]
        list: ListArg,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Remove a custom entry
    Remove {
        /// Pattern to remove
        pattern: String,

        /// Target list
        #[arg(short, long, value_enum, default_value = "blocklist")]
        list: ListArg,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Check a host against the persisted lists
    Check {
        /// Host to check
        host: String,

        #[command(flatten)]
        store: StoreArgs,
    },
}

/// Execute filter command
pub fn execute(args: FilterArgs) -> Result<()> {
    match args.command {
        FilterCommands::List { list, store } => list_entries(list, &store),
        FilterCommands::Add {
            pattern,
            list,
            store,
        } => add_entry(&pattern, list, &store),
        FilterCommands::Remove {
            pattern,
            list,
            store,
        } => remove_entry(&pattern, list, &store),
        FilterCommands::Check { host, store } => check_host(&host, &store),
    }
}

fn list_entries(only: Option<ListArg>, store_args: &StoreArgs) -> Result<()> {
    let (_, store) = store_args.open()?;
    let snapshot = store.snapshot();

    println!("{}", "═".repeat(50).bright_blue());
    println!("{}", " WebShield Lists".bright_white().bold());
    println!("{}", "═".repeat(50).bright_blue());

    let kinds = match only {
        Some(list) => vec![list.kind()],
        None => vec![ListKind::Blocklist, ListKind::Whitelist],
    };

    for kind in kinds {
        let custom = store.custom_entries(kind);
        println!(
            "{} ({} total, {} custom)",
            kind.name().bright_white().bold(),
            snapshot.list(kind).len().to_string().green(),
            custom.len()
        );
        if custom.is_empty() {
            println!("{}", "  (no custom entries)".dimmed());
        }
        for pattern in &custom {
            if pattern.starts_with("*.") || pattern.contains('/') {
                println!("  {} {}", "◉".yellow(), pattern);
            } else {
                println!("  {} {}", "●".green(), pattern);
            }
        }
        println!("{}", "─".repeat(50).bright_black());
    }

    if only.is_none() {
        println!("{}", "Sources".bright_white().bold());
        for (source, meta) in store.source_status() {
            let status = match meta.status {
                SourceStatus::Success => meta.status.to_string().green(),
                SourceStatus::Cache => meta.status.to_string().yellow(),
                SourceStatus::Error => meta.status.to_string().red(),
                SourceStatus::Pending => meta.status.to_string().dimmed(),
            };
            let updated = meta
                .last_update
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".into());
            println!(
                "  {:<16} {:<8} {:>8} entries  updated {}",
                source.id, status, meta.domain_count, updated
            );
            if let Some(ref error) = meta.last_error {
                println!("    {}", error.red());
            }
        }
        println!("{}", "═".repeat(50).bright_blue());
    }

    Ok(())
}

fn add_entry(pattern: &str, list: ListArg, store_args: &StoreArgs) -> Result<()> {
    let (_, store) = store_args.open()?;
    let kind = list.kind();

    let added = store
        .add_custom(kind, pattern)
        .with_context(|| format!("Failed to add {pattern} to the {kind}"))?;

    if added {
        println!("{} Added {} to {}", "✓".green(), pattern.cyan(), kind);
    } else {
        println!("{} {} is already in {}", "!".yellow(), pattern.cyan(), kind);
    }
    Ok(())
}

fn remove_entry(pattern: &str, list: ListArg, store_args: &StoreArgs) -> Result<()> {
    let (_, store) = store_args.open()?;
    let kind = list.kind();

    let removed = store
        .remove_custom(kind, pattern)
        .with_context(|| format!("Failed to remove {pattern} from the {kind}"))?;

    if removed {
        println!("{} Removed {} from {}", "✓".green(), pattern.cyan(), kind);
    } else {
        println!("{} {} is not a custom {} entry", "✗".red(), pattern.cyan(), kind);
    }
    Ok(())
}

/// Which lists a host matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HostMatch {
    whitelisted: bool,
    blocklisted: bool,
}

fn match_host(store: &ListStore, host: &str) -> HostMatch {
    let snapshot = store.snapshot();
    let host = normalize_host(host);
    HostMatch {
        whitelisted: snapshot.whitelist.matches(&host),
        blocklisted: snapshot.blocklist.matches(&host),
    }
}

fn check_host(host: &str, store_args: &StoreArgs) -> Result<()> {
    let (_, store) = store_args.open()?;
    let found = match_host(&store, host);

    let yes_no = |b: bool| if b { "Yes".yellow() } else { "No".normal() };
    println!("{}", "─".repeat(50).bright_black());
    println!("Host: {}", host.cyan());
    println!("Whitelist match: {}", yes_no(found.whitelisted));
    println!("Blocklist match: {}", yes_no(found.blocklisted));
    println!(
        "Result: {}",
        if found.whitelisted || !found.blocklisted {
            "Allowed by lists".green()
        } else {
            "Blocked Domain".red()
        }
    );
    println!("{}", "─".repeat(50).bright_black());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> StoreArgs {
        let config = dir.join("ws.toml");
        std::fs::write(&config, "[lists]\nsources = []\n").unwrap();
        StoreArgs {
            config: Some(config),
            data_dir: Some(dir.join("data")),
        }
    }

    #[test]
    fn test_add_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let args = store_in(dir.path());

        add_entry("*.ads.test", ListArg::Blocklist, &args).unwrap();

        let (_, store) = args.open().unwrap();
        assert_eq!(store.custom_entries(ListKind::Blocklist), vec!["*.ads.test"]);
        assert!(match_host(&store, "x.ads.test").blocklisted);
    }

    #[test]
    fn test_whitelist_and_blocklist_both_reported() {
        let dir = tempfile::tempdir().unwrap();
        let args = store_in(dir.path());

        add_entry("shop.test", ListArg::Blocklist, &args).unwrap();
        add_entry("*.shop.test", ListArg::Whitelist, &args).unwrap();

        let (_, store) = args.open().unwrap();
        let found = match_host(&store, "www.pay.shop.test");
        assert!(found.whitelisted);
        assert!(found.blocklisted);
    }

    #[test]
    fn test_remove_then_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let args = store_in(dir.path());

        add_entry("gone.test", ListArg::Blocklist, &args).unwrap();
        remove_entry("gone.test", ListArg::Blocklist, &args).unwrap();

        let (_, store) = args.open().unwrap();
        assert!(store.custom_entries(ListKind::Blocklist).is_empty());
        assert!(!match_host(&store, "gone.test").blocklisted);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let args = store_in(dir.path());
        assert!(add_entry("not a domain", ListArg::Blocklist, &args).is_err());
    }
}
