use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context};
use bstore_fs::CancelToken;
use bstore_stage::{SourceSpec, UploadOptions};
use bstore_store::{
    BundleStore, GcArea, GcReport, InMemoryReferenceAuthority, ManifestAuthority, PublishOutcome,
    ReferenceAuthority, StoreConfig,
};
use bstore_types::{OwnerId, TempId};
use colored::Colorize;
use serde_json::json;
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let json = matches!(cli.format, OutputFormat::Json);
    match cli.command {
        Command::Init(_) => cmd_init(config, json),
        Command::Upload(ref args) => cmd_upload(config, args, json),
        Command::Location(ref args) => cmd_location(config, args, json),
        Command::MakeTemp(ref args) => cmd_make_temp(config, args, json),
        Command::Cleanup(ref args) => cmd_cleanup(config, authority(&cli)?, args, json),
        Command::Gc(ref args) => cmd_gc(config, authority(&cli)?, args, json),
        Command::Reset(ref args) => cmd_reset(config, args),
    }
}

/// `--config` first, then `--root` on top.
fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => match &cli.root {
            Some(root) => StoreConfig::new(root),
            None => bail!("no store root: pass --root or --config"),
        },
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    debug!(root = %config.root.display(), sweep = ?config.data_sweep, "resolved configuration");
    Ok(config)
}

/// Deleting stored content needs a real reference source.
fn authority(cli: &Cli) -> anyhow::Result<Arc<dyn ReferenceAuthority>> {
    match &cli.references {
        Some(path) => Ok(Arc::new(ManifestAuthority::new(path))),
        None => bail!("--references is required to decide what is still in use"),
    }
}

fn open(config: StoreConfig, authority: Arc<dyn ReferenceAuthority>) -> anyhow::Result<BundleStore> {
    let root = config.root.clone();
    BundleStore::open(config, authority).with_context(|| format!("cannot open store at {}", root.display()))
}

fn open_unreferenced(config: StoreConfig) -> anyhow::Result<BundleStore> {
    open(config, Arc::new(InMemoryReferenceAuthority::new()))
}

fn cmd_init(config: StoreConfig, json: bool) -> anyhow::Result<()> {
    let store = open_unreferenced(config)?;
    if json {
        println!("{}", json!({ "root": store.root() }));
    } else {
        println!("{} Initialized bundle store in {}", "✓".green().bold(), store.root().display().to_string().bold());
    }
    Ok(())
}

fn cmd_upload(config: StoreConfig, args: &UploadArgs, json: bool) -> anyhow::Result<()> {
    let store = open_unreferenced(config)?;
    let sources: Vec<SourceSpec> = args.sources.iter().map(|s| SourceSpec::parse(s)).collect();
    let options = UploadOptions {
        follow_symlinks: args.follow_symlinks,
        exclude_patterns: args.exclude.clone(),
        git: args.git,
        unpack: args.unpack,
        remove_sources: args.remove_sources,
    };
    let receipt = store.upload(&sources, &options, &CancelToken::new())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&receipt)?);
        return Ok(());
    }
    let verb = match receipt.outcome {
        PublishOutcome::Published => "Stored".green(),
        PublishOutcome::Discarded => "Already stored".cyan(),
    };
    println!("{} {} {}", "✓".green().bold(), verb, receipt.hash.to_string().yellow());
    println!("  Size: {} bytes", receipt.metadata.data_size);
    println!("  Location: {}", receipt.location.display());
    Ok(())
}

fn cmd_location(config: StoreConfig, args: &LocationArgs, json: bool) -> anyhow::Result<()> {
    let store = open_unreferenced(config)?;
    let location = store.get_location(&args.hash, args.relative);
    let exists = store.resolve(&args.hash).is_ok();
    if json {
        println!("{}", json!({ "hash": args.hash, "location": location, "exists": exists }));
    } else if exists {
        println!("{}", location.display());
    } else {
        println!("{} {}", location.display(), "(not stored)".dimmed());
    }
    Ok(())
}

fn cmd_make_temp(config: StoreConfig, args: &MakeTempArgs, json: bool) -> anyhow::Result<()> {
    let store = open_unreferenced(config)?;
    let id = args.id.clone().unwrap_or_else(TempId::generate);
    let path = store.make_temp_location(&id)?;
    if json {
        println!("{}", json!({ "id": id, "path": path }));
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

fn cmd_cleanup(
    config: StoreConfig,
    authority: Arc<dyn ReferenceAuthority>,
    args: &CleanupArgs,
    json: bool,
) -> anyhow::Result<()> {
    let store = open(config, authority)?;
    let excluded: BTreeSet<OwnerId> = args.except.iter().map(|o| OwnerId::from(o.as_str())).collect();
    let report = store.cleanup(&args.hash, &excluded, args.dry_run)?;
    print_report(&report, json)
}

fn cmd_gc(
    config: StoreConfig,
    authority: Arc<dyn ReferenceAuthority>,
    args: &GcArgs,
    json: bool,
) -> anyhow::Result<()> {
    let store = open(config, authority)?;
    let report = store.full_cleanup(args.dry_run);
    print_report(&report, json)?;
    if !report.is_clean() {
        bail!("{} entries could not be collected", report.failures.len());
    }
    Ok(())
}

fn cmd_reset(config: StoreConfig, args: &ResetArgs) -> anyhow::Result<()> {
    if !args.yes {
        bail!("refusing to delete all stored content without --yes");
    }
    let store = open_unreferenced(config)?;
    store.reset()?;
    println!("{} Store reset: {}", "✓".green().bold(), store.root().display());
    Ok(())
}

fn print_report(report: &GcReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let verb = if report.dry_run { "would delete" } else { "deleted" };
    for action in &report.actions {
        let area = match action.area {
            GcArea::Data => "data".yellow(),
            GcArea::Temp => "temp".cyan(),
        };
        println!("  {} {} {}", verb.red(), area, action.path.display());
    }
    for failure in &report.failures {
        println!("  {} {}: {}", "failed".red().bold(), failure.path.display(), failure.error);
    }
    println!(
        "{} GC: {} {}, {} kept, {} failed",
        "✓".green(),
        report.actions.len(),
        verb,
        report.retained,
        report.failures.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("bstore").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn root_is_required() {
        let err = run_command(cli(&["init"])).unwrap_err();
        assert!(err.to_string().contains("--root"));
    }

    #[test]
    fn root_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("bstore.toml");
        fs::write(&config, "root = \"/from/config\"\ntemp_retention_secs = 5\n").unwrap();
        let root = dir.path().join("store");
        let parsed = cli(&[
            "--config",
            config.to_str().unwrap(),
            "--root",
            root.to_str().unwrap(),
            "init",
        ]);
        let loaded = load_config(&parsed).unwrap();
        assert_eq!(loaded.root, root);
        assert_eq!(loaded.temp_retention_secs, 5);
    }

    #[test]
    fn gc_requires_references() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command(cli(&["--root", dir.path().to_str().unwrap(), "gc"])).unwrap_err();
        assert!(err.to_string().contains("--references"));
    }

    #[test]
    fn reset_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_command(cli(&["--root", dir.path().to_str().unwrap(), "reset"])).is_err());
    }

    #[test]
    fn upload_then_gc_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let input = dir.path().join("input.txt");
        fs::write(&input, b"payload").unwrap();
        let refs = dir.path().join("refs.json");
        fs::write(&refs, "{}").unwrap();
        let root_arg = root.to_str().unwrap();

        run_command(cli(&["--root", root_arg, "upload", input.to_str().unwrap()])).unwrap();
        assert_eq!(fs::read_dir(root.join("data")).unwrap().count(), 1);

        run_command(cli(&["--root", root_arg, "--references", refs.to_str().unwrap(), "gc", "--dry-run"]))
            .unwrap();
        assert_eq!(fs::read_dir(root.join("data")).unwrap().count(), 1);
    }
}
