//! Check command - evaluate one URL offline

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use wshield_core::{FilterRequest, Verdict};

use super::filter::StoreArgs;

/// Check command arguments
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Absolute http:// or https:// URL
    pub url: String,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Execute the check command
///
/// Runs the full decision chain against the persisted lists. The threat feed
/// is not persisted, so only list and policy rules apply.
pub fn execute(args: CheckArgs) -> Result<()> {
    let verdict = evaluate(&args)?;

    if args.json {
        let out = serde_json::json!({
            "url": args.url,
            "blocked": verdict.blocked,
            "reason": verdict.reason_text(),
        });
        println!("{out}");
        return Ok(());
    }

    match verdict.reason_text() {
        Some(reason) if verdict.blocked => {
            println!("{} {} ({})", "BLOCKED".red().bold(), args.url, reason)
        }
        _ => println!("{} {}", "ALLOWED".green().bold(), args.url),
    }
    Ok(())
}

fn evaluate(args: &CheckArgs) -> Result<Verdict> {
    let request = FilterRequest::from_url(&args.url)
        .with_context(|| format!("Not an absolute http(s) URL: {}", args.url))?;

    let (config, store) = args.store.open()?;
    let engine = super::offline_engine(&config, store);
    Ok(engine.evaluate(&request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn args(dir: &Path, url: &str, config: &str) -> CheckArgs {
        let path = dir.join("ws.toml");
        std::fs::write(&path, config).unwrap();
        CheckArgs {
            url: url.to_string(),
            json: false,
            store: StoreArgs {
                config: Some(path),
                data_dir: Some(dir.join("data")),
            },
        }
    }

    #[test]
    fn test_inline_blocklist_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(
            dir.path(),
            "http://tracker.test/pixel.gif",
            "[lists]\nsources = []\nblocklist = [\"tracker.test\"]\n",
        );
        let verdict = evaluate(&a).unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.reason_text().as_deref(), Some("Blocked Domain"));
    }

    #[test]
    fn test_strict_policy_applies() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(
            dir.path(),
            "https://example.test:8443/",
            "[lists]\nsources = []\n[security]\nblock_non_standard_ports = true\n",
        );
        let verdict = evaluate(&a).unwrap();
        assert!(verdict.blocked);
        assert!(verdict.reason_text().unwrap().contains("Non-Standard Port"));
    }

    #[test]
    fn test_clean_url_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(dir.path(), "https://example.test/", "[lists]\nsources = []\n");
        assert!(!evaluate(&a).unwrap().blocked);
    }

    #[test]
    fn test_relative_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(dir.path(), "example.test/path", "[lists]\nsources = []\n");
        assert!(evaluate(&a).is_err());
    }
}
