//! The command-definition catalog.
//!
//! Two trees feed the catalog. The base tree is the standard vocabulary:
//! it defines structure and carries no custom constraints. The vendor tree
//! selects which commands the device supports, may tighten base
//! constraints, and may introduce vendor-private entries whose component
//! or command name starts with `_`. The exported definitions are the
//! vendor-selected set with base fields inherited.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::commands::schema::{self, codes, PropertySchema};
use crate::error::{domain, Error, Result};
use crate::privet::AuthScope;

/// A single merged command definition.
#[derive(Debug, Clone)]
pub struct CommandDefinition {
    pub component: String,
    pub command: String,
    pub parameters: PropertySchema,
    pub progress: Option<PropertySchema>,
    pub results: Option<PropertySchema>,
    pub minimal_role: AuthScope,
}

impl CommandDefinition {
    /// Full command name, `component.command`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.component, self.command)
    }
}

#[derive(Default)]
struct CatalogInner {
    /// Normalized base tree.
    base: Map<String, Value>,
    /// Normalized merged tree (vendor-selected entries).
    merged: Map<String, Value>,
    definitions: HashMap<String, Arc<CommandDefinition>>,
    fingerprint: u64,
}

/// Thread-safe catalog of command definitions.
#[derive(Default)]
pub struct CommandCatalog {
    inner: RwLock<CatalogInner>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the base tree. Every leaf must carry a `parameters` block
    /// and a `minimalRole`.
    pub fn load_base(&self, tree: &Value) -> Result<()> {
        let mut base = Map::new();
        for (component, commands) in tree_entries(tree)? {
            let mut normalized_commands = Map::new();
            for (command, def) in tree_entries(commands)? {
                let normalized = normalize_definition(def)?;
                if normalized.get("parameters").is_none() {
                    return Err(catalog_error(format!(
                        "base definition {component}.{command} lacks parameters"
                    )));
                }
                parse_minimal_role(&normalized).map_err(|e| {
                    Error::wrap(
                        domain::GCD,
                        e.code().to_string(),
                        format!("base definition {component}.{command}"),
                        e,
                    )
                })?;
                normalized_commands.insert(command.clone(), normalized);
            }
            base.insert(component.clone(), Value::Object(normalized_commands));
        }

        let mut inner = self.inner.write();
        inner.base = base;
        inner.merged = Map::new();
        inner.definitions = HashMap::new();
        inner.fingerprint += 1;
        Ok(())
    }

    /// Merge a vendor tree atop the base. Entries present in base may only
    /// tighten it; new entries need a `_`-prefixed component or command.
    pub fn load_vendor(&self, tree: &Value) -> Result<()> {
        let mut inner = self.inner.write();
        let mut merged = Map::new();
        let mut definitions = HashMap::new();

        for (component, commands) in tree_entries(tree)? {
            let mut merged_commands = Map::new();
            for (command, def) in tree_entries(commands)? {
                let vendor_def = normalize_definition(def)?;
                let base_def = inner
                    .base
                    .get(component)
                    .and_then(|c| c.get(command.as_str()));

                let merged_def = match base_def {
                    Some(base_def) => {
                        let merged_def = schema::deep_merge(base_def, &vendor_def);
                        check_tightens(base_def, &merged_def).map_err(|e| {
                            Error::wrap(
                                domain::GCD,
                                e.code().to_string(),
                                format!("vendor definition {component}.{command} contradicts base"),
                                e,
                            )
                        })?;
                        merged_def
                    }
                    None => {
                        if !component.starts_with('_') && !command.starts_with('_') {
                            return Err(catalog_error(format!(
                                "unknown command {component}.{command}: vendor names must start with '_'"
                            )));
                        }
                        if vendor_def.get("parameters").is_none() {
                            return Err(catalog_error(format!(
                                "vendor definition {component}.{command} lacks parameters"
                            )));
                        }
                        vendor_def
                    }
                };

                let definition =
                    parse_definition(component, command, &merged_def)?;
                definitions.insert(
                    definition.full_name(),
                    Arc::new(definition),
                );
                merged_commands.insert(command.clone(), merged_def);
            }
            merged.insert(component.clone(), Value::Object(merged_commands));
        }

        inner.merged = merged;
        inner.definitions = definitions;
        inner.fingerprint += 1;
        Ok(())
    }

    /// The merged definitions document, as sent to the cloud and to local
    /// clients. Empty progress/results blocks are omitted.
    pub fn get_definitions(&self) -> Value {
        let inner = self.inner.read();
        let mut out = Map::new();
        for (component, commands) in &inner.merged {
            let Some(commands) = commands.as_object() else { continue };
            let mut out_commands = Map::new();
            for (command, def) in commands {
                out_commands.insert(command.clone(), export_definition(def));
            }
            out.insert(component.clone(), Value::Object(out_commands));
        }
        Value::Object(out)
    }

    /// Changes whenever the catalog content changes.
    pub fn fingerprint(&self) -> u64 {
        self.inner.read().fingerprint
    }

    /// Look up a definition by full name (`component.command`).
    pub fn find(&self, full_name: &str) -> Option<Arc<CommandDefinition>> {
        self.inner.read().definitions.get(full_name).cloned()
    }

    /// Validate a command instance: known name, sufficient caller role,
    /// parameters structurally valid.
    pub fn validate_instance(
        &self,
        full_name: &str,
        parameters: &Value,
        caller: AuthScope,
    ) -> Result<Arc<CommandDefinition>> {
        let definition = self.find(full_name).ok_or_else(|| {
            Error::new(
                domain::GCD,
                "unknown_command",
                format!("unknown command '{full_name}'"),
            )
        })?;
        if caller < definition.minimal_role {
            return Err(Error::new(
                domain::GCD,
                "access_denied",
                format!(
                    "command '{full_name}' requires role {}",
                    definition.minimal_role
                ),
            ));
        }
        definition.parameters.validate(parameters)?;
        Ok(definition)
    }
}

fn catalog_error(message: String) -> Error {
    Error::new(domain::GCD, codes::INVALID_SCHEMA, message)
}

fn tree_entries(tree: &Value) -> Result<impl Iterator<Item = (&String, &Value)>> {
    tree.as_object()
        .map(|m| m.iter())
        .ok_or_else(|| catalog_error("definition tree must be an object".into()))
}

/// Normalize the schema blocks inside one command definition.
fn normalize_definition(def: &Value) -> Result<Value> {
    let obj = def
        .as_object()
        .ok_or_else(|| catalog_error("command definition must be an object".into()))?;
    let mut out = obj.clone();
    for block in ["parameters", "progress", "results"] {
        if let Some(value) = obj.get(block) {
            out.insert(block.into(), schema::normalize_block(value)?);
        }
    }
    Ok(Value::Object(out))
}

fn parse_minimal_role(def: &Value) -> Result<AuthScope> {
    let role_str = def
        .get("minimalRole")
        .and_then(Value::as_str)
        .ok_or_else(|| catalog_error("definition lacks minimalRole".into()))?;
    match AuthScope::parse(role_str) {
        Some(scope) if scope >= AuthScope::Viewer => Ok(scope),
        _ => Err(catalog_error(format!("invalid minimalRole '{role_str}'"))),
    }
}

fn parse_block(def: &Value, block: &str) -> Result<Option<PropertySchema>> {
    match def.get(block) {
        Some(value) => Ok(Some(PropertySchema::parse_object_block(value)?)),
        None => Ok(None),
    }
}

fn parse_definition(
    component: &str,
    command: &str,
    merged_def: &Value,
) -> Result<CommandDefinition> {
    Ok(CommandDefinition {
        component: component.to_string(),
        command: command.to_string(),
        parameters: parse_block(merged_def, "parameters")?
            .unwrap_or_else(PropertySchema::empty_object),
        progress: parse_block(merged_def, "progress")?.filter(|s| !s.properties.is_empty()),
        results: parse_block(merged_def, "results")?.filter(|s| !s.properties.is_empty()),
        minimal_role: parse_minimal_role(merged_def)?,
    })
}

/// Tighten check across the three schema blocks of a definition, plus the
/// monotone minimalRole rule.
fn check_tightens(base_def: &Value, merged_def: &Value) -> Result<()> {
    for block in ["parameters", "progress", "results"] {
        let (Some(base), Some(merged)) = (base_def.get(block), merged_def.get(block)) else {
            continue;
        };
        let base = PropertySchema::parse_object_block(base)?;
        let merged = PropertySchema::parse_object_block(merged)?;
        merged.tightens(&base)?;
    }

    let base_role = parse_minimal_role(base_def)?;
    let merged_role = parse_minimal_role(merged_def)?;
    if merged_role < base_role {
        return Err(catalog_error(format!(
            "minimalRole lowered from {base_role} to {merged_role}"
        )));
    }
    Ok(())
}

/// Export shape of one definition: parameters + minimalRole, with
/// progress/results included only when non-empty.
fn export_definition(def: &Value) -> Value {
    let mut out = Map::new();
    if let Some(params) = def.get("parameters") {
        out.insert("parameters".into(), params.clone());
    }
    for block in ["progress", "results"] {
        if let Some(value) = def.get(block) {
            if value.as_object().is_some_and(|m| !m.is_empty()) {
                out.insert(block.into(), value.clone());
            }
        }
    }
    if let Some(role) = def.get("minimalRole") {
        out.insert("minimalRole".into(), role.clone());
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_tree() -> Value {
        json!({
            "base": {
                "reboot": {
                    "parameters": {"delay": "integer"},
                    "minimalRole": "user",
                    "results": {}
                },
                "shutdown": {
                    "parameters": {},
                    "minimalRole": "user",
                    "results": {}
                }
            }
        })
    }

    fn vendor_tree() -> Value {
        json!({
            "base": {
                "reboot": {
                    "parameters": {"delay": {"minimum": 10}},
                    "minimalRole": "user",
                    "results": {}
                }
            },
            "robot": {
                "_jump": {
                    "parameters": {"_height": "integer"},
                    "minimalRole": "user",
                    "results": {}
                }
            }
        })
    }

    fn loaded_catalog() -> CommandCatalog {
        let catalog = CommandCatalog::new();
        catalog.load_base(&base_tree()).unwrap();
        catalog.load_vendor(&vendor_tree()).unwrap();
        catalog
    }

    #[test]
    fn test_merged_definitions_export() {
        let catalog = loaded_catalog();
        let expected = json!({
            "base": {
                "reboot": {
                    "parameters": {
                        "delay": {"minimum": 10, "type": "integer"}
                    },
                    "minimalRole": "user"
                }
            },
            "robot": {
                "_jump": {
                    "parameters": {
                        "_height": {"type": "integer"}
                    },
                    "minimalRole": "user"
                }
            }
        });
        assert_eq!(catalog.get_definitions(), expected);
    }

    #[test]
    fn test_vendor_selects_supported_commands() {
        let catalog = loaded_catalog();
        assert!(catalog.find("base.reboot").is_some());
        assert!(catalog.find("robot._jump").is_some());
        // In the base vocabulary but not selected by the vendor.
        assert!(catalog.find("base.shutdown").is_none());
    }

    #[test]
    fn test_vendor_cannot_loosen_bounds() {
        let catalog = CommandCatalog::new();
        catalog
            .load_base(&json!({
                "base": {
                    "reboot": {
                        "parameters": {"delay": {"type": "integer", "minimum": 5}},
                        "minimalRole": "user"
                    }
                }
            }))
            .unwrap();
        let err = catalog
            .load_vendor(&json!({
                "base": {
                    "reboot": {
                        "parameters": {"delay": {"minimum": 1}},
                        "minimalRole": "user"
                    }
                }
            }))
            .unwrap_err();
        assert!(err.has_error(domain::GCD, codes::INVALID_SCHEMA));
    }

    #[test]
    fn test_vendor_cannot_lower_minimal_role() {
        let catalog = CommandCatalog::new();
        catalog
            .load_base(&json!({
                "base": {
                    "reboot": {"parameters": {}, "minimalRole": "manager"}
                }
            }))
            .unwrap();
        assert!(catalog
            .load_vendor(&json!({
                "base": {
                    "reboot": {"parameters": {}, "minimalRole": "user"}
                }
            }))
            .is_err());

        // Raising is fine.
        catalog
            .load_vendor(&json!({
                "base": {
                    "reboot": {"parameters": {}, "minimalRole": "owner"}
                }
            }))
            .unwrap();
        assert_eq!(
            catalog.find("base.reboot").unwrap().minimal_role,
            AuthScope::Owner
        );
    }

    #[test]
    fn test_new_vendor_names_need_underscore() {
        let catalog = CommandCatalog::new();
        catalog.load_base(&base_tree()).unwrap();
        let err = catalog
            .load_vendor(&json!({
                "robot": {
                    "jump": {"parameters": {}, "minimalRole": "user"}
                }
            }))
            .unwrap_err();
        assert!(err.has_error(domain::GCD, codes::INVALID_SCHEMA));
    }

    #[test]
    fn test_validate_instance() {
        let catalog = loaded_catalog();

        let def = catalog
            .validate_instance("base.reboot", &json!({"delay": 30}), AuthScope::User)
            .unwrap();
        assert_eq!(def.minimal_role, AuthScope::User);

        // Tightened bound applies.
        assert!(catalog
            .validate_instance("base.reboot", &json!({"delay": 1}), AuthScope::User)
            .is_err());

        // Insufficient role.
        let err = catalog
            .validate_instance("base.reboot", &json!({"delay": 30}), AuthScope::Viewer)
            .unwrap_err();
        assert!(err.has_error(domain::GCD, "access_denied"));

        // Unknown command.
        let err = catalog
            .validate_instance("base.frobnicate", &json!({}), AuthScope::Owner)
            .unwrap_err();
        assert!(err.has_error(domain::GCD, "unknown_command"));
    }

    #[test]
    fn test_fingerprint_bumps_on_load() {
        let catalog = CommandCatalog::new();
        let f0 = catalog.fingerprint();
        catalog.load_base(&base_tree()).unwrap();
        let f1 = catalog.fingerprint();
        assert_ne!(f0, f1);
        catalog.load_vendor(&vendor_tree()).unwrap();
        assert_ne!(f1, catalog.fingerprint());
    }
}
