//! Buildset resolution and submission against the database.

use anyhow::{Context, Result};
use buildmerge_config::{MergerConfig, Registry, load_merger_config};
use buildmerge_core::{NewBuildset, Priority, Properties};
use buildmerge_db::PgBuildRequestRepo;
use buildmerge_scheduler::BuildRequestMerger;
use std::sync::Arc;

use crate::BuildsetArgs;

/// Source label of properties given on the command line.
const CLI_SOURCE: &str = "CLI";

async fn connect(database_url: &str, config: MergerConfig) -> Result<BuildRequestMerger> {
    let pool = buildmerge_db::create_pool(database_url)
        .await
        .context("Failed to connect to database")?;
    let repo = Arc::new(PgBuildRequestRepo::new(pool));
    Ok(BuildRequestMerger::new(repo, config))
}

fn prepare(args: BuildsetArgs) -> Result<(MergerConfig, NewBuildset)> {
    let config = load_merger_config(&args.config, &Registry::with_builtins())
        .with_context(|| format!("Failed to load merger config: {}", args.config))?;

    let properties = args
        .properties
        .into_iter()
        .fold(Properties::new(), |properties, (name, value)| {
            properties.with(name, value, CLI_SOURCE)
        });

    let mut buildset = NewBuildset::new(args.sourcestampset, args.reason)
        .with_properties(properties)
        .with_builders(args.builders)
        .with_priority(Priority(args.priority));
    if let Some(brid) = args.triggered_by {
        buildset = buildset.triggered_by(brid);
    }
    if let Some(external_id) = args.external_id {
        buildset = buildset.with_external_idstring(external_id);
    }
    Ok((config, buildset))
}

pub async fn resolve(database_url: &str, args: BuildsetArgs) -> Result<()> {
    let (config, buildset) = prepare(args)?;
    let merger = connect(database_url, config).await?;

    let resolution = merger.resolve(&buildset).await?;
    for (builder, target) in &resolution.targets {
        let elapsed = resolution.elapsed.get(builder).copied().unwrap_or_default();
        match target {
            Some(target) => println!(
                "{:<24} merge into {} (buildset {}, build {}) [{:?}]",
                builder,
                target.brid,
                target.buildset_id,
                target
                    .build_number
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                elapsed
            ),
            None => println!("{:<24} fresh build [{:?}]", builder, elapsed),
        }
    }
    Ok(())
}

pub async fn submit(database_url: &str, args: BuildsetArgs) -> Result<()> {
    let (config, buildset) = prepare(args)?;
    let merger = connect(database_url, config).await?;

    let submitted = merger.submit_buildset(buildset).await.map_err(submit_error)?;
    println!("{}", serde_json::to_string_pretty(&submitted)?);
    Ok(())
}

fn submit_error(err: buildmerge_core::Error) -> anyhow::Error {
    let retryable = err.is_retryable();
    let err = anyhow::Error::new(err);
    if retryable {
        err.context("Submission was not committed; it is safe to retry")
    } else {
        err
    }
}
