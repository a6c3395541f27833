//! Merger configuration parsing.

use crate::nodes::{
    get_all_string_args, get_first_bool_arg, get_first_string_arg, get_integer_prop,
    get_string_prop,
};
use crate::{ConfigError, ConfigResult, Registry};
use buildmerge_core::{BuilderMergeConfig, MergePolicy};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Capacity used for both lookup caches unless configured otherwise.
pub const DEFAULT_CACHE_SIZE: usize = 20_000;

/// Which existing requests a new request may merge into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeScope {
    /// Requests in the same trigger chain.
    #[default]
    Chain,
    /// Requests building the same sourcestamps at the same priority.
    SourceStamp {
        /// Only merge into requests that are already running.
        claimed_only: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSizes {
    pub chain_start: usize,
    pub properties: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self {
            chain_start: DEFAULT_CACHE_SIZE,
            properties: DEFAULT_CACHE_SIZE,
        }
    }
}

/// Deployment-wide merger settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergerSettings {
    pub scope: MergeScope,
    /// Check mergeability for builders whose policy is `disabled` too,
    /// using default property equality.
    pub always_check: bool,
    pub cache: CacheSizes,
}

/// Parsed merger configuration.
#[derive(Debug, Clone, Default)]
pub struct MergerConfig {
    pub settings: MergerSettings,
    pub builders: BTreeMap<String, BuilderMergeConfig>,
}

impl MergerConfig {
    pub fn builder(&self, name: &str) -> Option<&BuilderMergeConfig> {
        self.builders.get(name)
    }

    pub fn with_builder(mut self, name: impl Into<String>, config: BuilderMergeConfig) -> Self {
        self.builders.insert(name.into(), config);
        self
    }

    pub fn with_settings(mut self, settings: MergerSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Read and parse a merger configuration file.
pub fn load_merger_config(path: impl AsRef<Path>, registry: &Registry) -> ConfigResult<MergerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_merger_config(&content, registry)
}

/// Parse a merger configuration from KDL text.
pub fn parse_merger_config(kdl: &str, registry: &Registry) -> ConfigResult<MergerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut settings = None;
    let mut builders = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "merger" => {
                if settings.is_some() {
                    return Err(ConfigError::Duplicate("merger".to_string()));
                }
                settings = Some(parse_settings(node)?);
            }
            "builder" => {
                let (name, config) = parse_builder(node, registry)?;
                if builders.contains_key(&name) {
                    return Err(ConfigError::Duplicate(format!("builder '{}'", name)));
                }
                builders.insert(name, config);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(MergerConfig {
        settings: settings.unwrap_or_default(),
        builders,
    })
}

fn parse_settings(node: &KdlNode) -> ConfigResult<MergerSettings> {
    let mut scope_name = String::from("chain");
    let mut claimed_only = true;
    let mut always_check = false;
    let mut cache = CacheSizes::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "scope" => {
                    scope_name = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("merger scope".to_string()))?;
                }
                "claimed-only" => {
                    claimed_only = get_first_bool_arg(child).ok_or_else(|| invalid_bool("claimed-only"))?;
                }
                "always-check" => {
                    always_check = get_first_bool_arg(child).ok_or_else(|| invalid_bool("always-check"))?;
                }
                "cache" => {
                    if let Some(size) = get_integer_prop(child, "chain-start") {
                        cache.chain_start = cache_size("chain-start", size)?;
                    }
                    if let Some(size) = get_integer_prop(child, "properties") {
                        cache.properties = cache_size("properties", size)?;
                    }
                }
                _ => {}
            }
        }
    }

    let scope = match scope_name.as_str() {
        "chain" => MergeScope::Chain,
        "sourcestamp" => MergeScope::SourceStamp { claimed_only },
        other => {
            return Err(ConfigError::InvalidValue {
                field: "merger scope".to_string(),
                message: format!("unknown scope: {}", other),
            });
        }
    };

    Ok(MergerSettings {
        scope,
        always_check,
        cache,
    })
}

fn parse_builder(node: &KdlNode, registry: &Registry) -> ConfigResult<(String, BuilderMergeConfig)> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("builder name".to_string()))?;

    let mut policy = MergePolicy::Default;
    let mut merge_properties = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "merge" => {
                    let kind = get_first_string_arg(child).unwrap_or_default();
                    policy = match kind.as_str() {
                        "default" | "" => MergePolicy::Default,
                        "disabled" => MergePolicy::Disabled,
                        "custom" => {
                            let predicate = get_string_prop(child, "predicate").ok_or_else(|| {
                                ConfigError::MissingField(format!(
                                    "merge predicate for builder '{}'",
                                    name
                                ))
                            })?;
                            MergePolicy::Custom(registry.predicate(&predicate)?)
                        }
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                field: format!("merge policy for builder '{}'", name),
                                message: format!("unknown merge policy: {}", kind),
                            });
                        }
                    };
                }
                "merge-properties" => {
                    merge_properties.extend(get_all_string_args(child));
                }
                _ => {}
            }
        }
    }

    Ok((
        name,
        BuilderMergeConfig {
            policy,
            merge_properties,
        },
    ))
}

fn invalid_bool(field: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected #true or #false".to_string(),
    }
}

fn cache_size(field: &str, size: i128) -> ConfigResult<usize> {
    usize::try_from(size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: format!("cache {}", field),
            message: format!("capacity must be a positive integer, got {}", size),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            merger {
                scope "sourcestamp"
                claimed-only #false
                always-check #true
                cache chain-start=100 properties=200
            }

            builder "build-a" {
                merge "default"
                merge-properties "platform" "arch"
            }

            builder "build-b" {
                merge "disabled"
            }

            builder "build-c" {
                merge "custom" predicate="same-sources"
            }
        "#;

        let config = parse_merger_config(kdl, &Registry::with_builtins()).unwrap();
        assert_eq!(
            config.settings.scope,
            MergeScope::SourceStamp {
                claimed_only: false
            }
        );
        assert!(config.settings.always_check);
        assert_eq!(config.settings.cache.chain_start, 100);
        assert_eq!(config.settings.cache.properties, 200);

        let a = config.builder("build-a").unwrap();
        assert!(matches!(a.policy, MergePolicy::Default));
        assert_eq!(a.merge_properties, vec!["platform", "arch"]);
        assert!(matches!(
            config.builder("build-b").unwrap().policy,
            MergePolicy::Disabled
        ));
        assert_eq!(config.builder("build-c").unwrap().policy.name(), "same-sources");
    }

    #[test]
    fn test_defaults_without_merger_node() {
        let kdl = r#"
            builder "build-a"
        "#;

        let config = parse_merger_config(kdl, &Registry::new()).unwrap();
        assert_eq!(config.settings.scope, MergeScope::Chain);
        assert!(!config.settings.always_check);
        assert_eq!(config.settings.cache, CacheSizes::default());
        assert!(matches!(
            config.builder("build-a").unwrap().policy,
            MergePolicy::Default
        ));
        assert!(config.builder("build-z").is_none());
    }

    #[test]
    fn test_unregistered_predicate_rejected() {
        let kdl = r#"
            builder "build-c" {
                merge "custom" predicate="by-owner"
            }
        "#;

        let result = parse_merger_config(kdl, &Registry::with_builtins());
        assert!(matches!(result, Err(ConfigError::UnknownPredicate(_))));
    }

    #[test]
    fn test_custom_without_predicate_rejected() {
        let kdl = r#"
            builder "build-c" {
                merge "custom"
            }
        "#;

        let result = parse_merger_config(kdl, &Registry::with_builtins());
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_duplicate_builder_rejected() {
        let kdl = r#"
            builder "build-a"
            builder "build-a"
        "#;

        let result = parse_merger_config(kdl, &Registry::new());
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_invalid_scope_and_cache_size() {
        let bad_scope = r#"
            merger {
                scope "galaxy"
            }
        "#;
        assert!(matches!(
            parse_merger_config(bad_scope, &Registry::new()),
            Err(ConfigError::InvalidValue { .. })
        ));

        let bad_cache = r#"
            merger {
                cache properties=0
            }
        "#;
        assert!(matches!(
            parse_merger_config(bad_cache, &Registry::new()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_error_maps_to_configuration() {
        let err: buildmerge_core::Error = ConfigError::UnknownPredicate("x".to_string()).into();
        assert!(err.is_configuration());
    }
}
