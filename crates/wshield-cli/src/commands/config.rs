//! Config command - configuration management

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::info;
use wshield_core::{Config, Profile};

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration as TOML
    Show {
        /// Config file to show (default: detect)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Profile to show
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Generate a configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "webshield.toml")]
        output: PathBuf,

        /// Profile to use as base
        #[arg(short, long, default_value = "balanced")]
        profile: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate
        file: PathBuf,
    },

    /// Show config and data locations
    Paths,

    /// List available profiles
    Profiles,
}

/// Execute config command
pub fn execute(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show { file, profile } => show_config(file, profile),
        ConfigAction::Generate {
            output,
            profile,
            force,
        } => generate_config(&output, &profile, force),
        ConfigAction::Validate { file } => validate_config(&file),
        ConfigAction::Paths => show_paths(),
        ConfigAction::Profiles => show_profiles(),
    }
}

fn show_config(file: Option<PathBuf>, profile: Option<String>) -> Result<()> {
    let config = super::load_config(file.as_deref(), profile.as_deref())?;
    let toml_str = config.to_toml().context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

fn render_config(profile_name: &str) -> Result<String> {
    let profile = Profile::from_name(profile_name)
        .with_context(|| format!("Unknown profile: {profile_name}"))?;
    let config = Config::from_profile(profile);
    let toml_str = config.to_toml().context("Failed to serialize config")?;

    Ok(format!(
        "# WebShield Configuration\n\
         # Generated from profile: {}\n\
         # Unlisted options fall back to their defaults\n\n\
         {}",
        profile, toml_str
    ))
}

fn generate_config(output: &Path, profile_name: &str, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }

    let content = render_config(profile_name)?;
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), "Generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: &Path) -> Result<()> {
    let config = Config::load(file)
        .with_context(|| format!("Failed to load config from {}", file.display()))?;
    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{} Configuration is valid", "✓".green());
    println!(
        "  Profile: {}",
        config.profile.map(|p| p.to_string()).unwrap_or_else(|| "custom".into())
    );
    println!("  Listen: {}", config.proxy.listen_addr());
    println!("  Sources: {}", config.lists.sources.len());
    println!("  Threat feed: {}", config.threat.enabled);
    println!("  Rate limit: {}", config.rate_limit.enabled);

    Ok(())
}

fn show_paths() -> Result<()> {
    println!("Configuration file search paths:");
    println!();
    println!("  1. ./webshield.toml");
    println!("  2. ./config.toml");
    if let Some(path) = super::user_config_file() {
        println!("  3. {}", path.display());
    }

    if let Some(found) = super::find_config_file() {
        println!();
        println!("Active: {}", found.display().to_string().cyan());
    }

    println!();
    println!("Data directory (lists, custom entries, source caches):");
    println!();
    match super::default_data_dir() {
        Some(dir) => println!("  {}", dir.display()),
        None => println!("  {}", "(unavailable; set lists.data_dir)".yellow()),
    }

    Ok(())
}

fn show_profiles() -> Result<()> {
    for profile in Profile::all() {
        println!("  {:<10} {}", profile.name().cyan(), profile.description());
    }
    Ok(())
}
