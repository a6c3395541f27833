//! CLI command implementations.

pub mod merge;

use anyhow::{Context, Result};
use buildmerge_config::{Registry, load_merger_config};
use buildmerge_core::MergePolicy;

pub fn validate(path: &str) -> Result<()> {
    match load_merger_config(path, &Registry::with_builtins()) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("Scope: {:?}", config.settings.scope);
            for (name, builder) in &config.builders {
                match &builder.policy {
                    MergePolicy::Custom(predicate) => {
                        println!("  {}: custom ({})", name, predicate.name())
                    }
                    policy => println!("  {}: {}", name, policy.name()),
                }
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub async fn migrate(database_url: &str) -> Result<()> {
    let pool = buildmerge_db::create_pool(database_url)
        .await
        .context("Failed to connect to database")?;
    buildmerge_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

/// Parse `NAME=VALUE`, reading VALUE as JSON when it is valid JSON.
pub fn parse_property(s: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("empty property name in '{}'", s));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("force_rebuild=false").unwrap(),
            ("force_rebuild".to_string(), json!(false))
        );
        assert_eq!(
            parse_property("platform=linux").unwrap(),
            ("platform".to_string(), json!("linux"))
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }
}
