//! CLI commands

pub mod check;
pub mod completions;
pub mod config;
pub mod filter;
pub mod run;

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wshield_core::lists::{FileFetcher, FilePersistence};
use wshield_core::threat::NoThreatFeed;
use wshield_core::{Config, FilterEngine, ListStore, Profile, RateLimiter, VerdictCache};

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy (main command)
    Run(run::RunArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Custom whitelist/blocklist management
    Filter(filter::FilterArgs),

    /// Evaluate one URL against the persisted lists
    Check(check::CheckArgs),

    /// Generate shell completions
    Completions(completions::CompletionsArgs),
}

/// Application name used for platform directories
const APP_NAME: &str = "webshield";

/// Config files tried in order when none is given
const CONFIG_CANDIDATES: [&str; 2] = ["webshield.toml", "config.toml"];

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// First existing config file in the search path
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .chain(project_dirs().map(|d| d.config_dir().join("config.toml")))
        .find(|p| p.exists())
}

/// Resolve configuration: explicit file, then profile, then discovery, then defaults
pub fn load_config(file: Option<&Path>, profile: Option<&str>) -> Result<Config> {
    if let Some(path) = file {
        return Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    if let Some(name) = profile {
        let profile =
            Profile::from_name(name).with_context(|| format!("Unknown profile: {name}"))?;
        return Ok(Config::from_profile(profile));
    }

    match find_config_file() {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::from_profile(Profile::default())),
    }
}

/// Where lists are persisted: flag, then config, then the platform data dir
pub fn data_dir(config: &Config, overridden: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = overridden.or(config.lists.data_dir.as_deref()) {
        return Ok(dir.to_path_buf());
    }
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .context("Could not determine a data directory; pass --data-dir")
}

/// Default location of the data dir, for display
pub fn default_data_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_dir().to_path_buf())
}

/// Default location of the user config file, for display
pub fn user_config_file() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

/// List store over the persisted data dir, without network access
pub fn offline_store(config: &Config, data_dir: &Path) -> Result<Arc<ListStore>> {
    let persistence = FilePersistence::new(data_dir)
        .with_context(|| format!("Failed to open data dir {}", data_dir.display()))?;
    let store = Arc::new(ListStore::new(
        config.lists.clone(),
        Arc::new(FileFetcher::new()),
        Arc::new(persistence),
    ));
    store.init().context("Failed to load persisted lists")?;
    Ok(store)
}

/// Engine over persisted lists with no threat feed
pub fn offline_engine(config: &Config, lists: Arc<ListStore>) -> Arc<FilterEngine> {
    let engine = Arc::new(FilterEngine::new(
        config,
        lists,
        Arc::new(RateLimiter::from_config(&config.rate_limit)),
        Arc::new(NoThreatFeed),
        Arc::new(VerdictCache::from_config(&config.cache)),
    ));
    engine.attach();
    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws.toml");
        std::fs::write(&path, "[proxy]\nport = 9191\n").unwrap();

        let config = load_config(Some(&path), Some("strict")).unwrap();
        assert_eq!(config.proxy.port, 9191);
        assert!(!config.security.force_https);
    }

    #[test]
    fn test_profile_used_without_file() {
        let config = load_config(None, Some("strict")).unwrap();
        assert!(config.security.force_https);
        assert!(load_config(None, Some("paranoid")).is_err());
    }

    #[test]
    fn test_data_dir_precedence() {
        let mut config = Config::default();
        config.lists.data_dir = Some(PathBuf::from("/from/config"));

        let flag = PathBuf::from("/from/flag");
        assert_eq!(data_dir(&config, Some(&flag)).unwrap(), flag);
        assert_eq!(
            data_dir(&config, None).unwrap(),
            PathBuf::from("/from/config")
        );
    }
}
