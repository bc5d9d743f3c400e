use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::record::{lookup_value, Record};

/// Capability set every plugin exposes. Check and filter contexts use
/// `eval_bool`; append/mutation contexts use `eval_value`.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// True when the plugin's declared return type is `bool`. Check-context
    /// references require this at build time.
    fn returns_bool(&self) -> bool;

    async fn eval_bool(&self, args: &[Value]) -> Result<bool>;

    /// Evaluate for a value. `Ok(None)` means "no result"; the caller skips
    /// the append.
    async fn eval_value(&self, args: &[Value]) -> Result<Option<Value>>;
}

/// Name → plugin map plus the separate draft set. Draft (unsaved) plugins
/// are visible so validation can name them, but any reference to one is
/// rejected at build.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    drafts: HashSet<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn register_draft(&mut self, name: &str) {
        self.drafts.insert(name.to_string());
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn is_draft(&self, name: &str) -> bool {
        self.drafts.contains(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("drafts", &self.drafts)
            .finish()
    }
}

/// One parsed plugin argument descriptor, resolved against the working
/// record at call time.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgSpec {
    /// A typed literal from the source (`"…"`, `'…'`, int, float, bool).
    Literal(Value),
    /// A dotted field path resolved to its typed value; absent fields pass
    /// the empty string for compatibility.
    FieldRef(String),
    /// `_$ORIDATA`: a deep-copied snapshot of the whole working record.
    RawData,
}

/// A plugin reference bound at ruleset build time: resolved plugin handle,
/// parsed argument descriptors, and the negation flag from a leading `!`.
#[derive(Clone)]
pub struct BoundPluginCall {
    pub name: String,
    pub negated: bool,
    pub args: Vec<ArgSpec>,
    pub plugin: Arc<dyn Plugin>,
}

impl fmt::Debug for BoundPluginCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundPluginCall")
            .field("name", &self.name)
            .field("negated", &self.negated)
            .field("args", &self.args)
            .finish()
    }
}

/// Translate argument descriptors into concrete values from `record`.
pub fn bind_args(args: &[ArgSpec], record: &Record) -> Vec<Value> {
    args.iter()
        .map(|arg| match arg {
            ArgSpec::Literal(value) => value.clone(),
            ArgSpec::FieldRef(path) => match lookup_value(record, path) {
                Some(value) => value.clone(),
                None => Value::String(String::new()),
            },
            ArgSpec::RawData => Value::Object(record.clone()),
        })
        .collect()
}

impl BoundPluginCall {
    /// Check-context invocation: bind, call `eval_bool`, apply negation.
    /// Failures are surfaced to the caller, which logs and treats the check
    /// as false.
    pub async fn eval_bool(&self, record: &Record) -> Result<bool> {
        let args = bind_args(&self.args, record);
        let result = self.plugin.eval_bool(&args).await?;
        Ok(if self.negated { !result } else { result })
    }

    /// Append-context invocation: bind and call `eval_value`.
    pub async fn eval_value(&self, record: &Record) -> Result<Option<Value>> {
        let args = bind_args(&self.args, record);
        self.plugin.eval_value(&args).await
    }

    /// Side-effect invocation for standalone `<plugin>` operations. The
    /// boolean (or value) result is discarded; failures are logged and
    /// non-fatal.
    pub async fn invoke(&self, record: &Record) {
        let args = bind_args(&self.args, record);
        let outcome = if self.plugin.returns_bool() {
            self.plugin.eval_bool(&args).await.map(|_| ())
        } else {
            self.plugin.eval_value(&args).await.map(|_| ())
        };
        if let Err(e) = outcome {
            warn!(plugin = %self.name, error = %e, "plugin invocation failed");
        }
    }
}

/// Resolve a plugin reference against the registry, enforcing existence,
/// the draft rejection rule and (for check contexts) the bool return type.
pub fn resolve_plugin(
    registry: &PluginRegistry,
    name: &str,
    check_context: bool,
) -> Result<Arc<dyn Plugin>> {
    if registry.is_draft(name) {
        return Err(EngineError::plugin(format!(
            "plugin {} is a draft and cannot be referenced",
            name
        )));
    }
    let plugin = registry
        .get(name)
        .ok_or_else(|| EngineError::plugin(format!("plugin {} is not registered", name)))?;
    if check_context && !plugin.returns_bool() {
        return Err(EngineError::plugin(format!(
            "plugin {} does not return bool and cannot be used in a check",
            name
        )));
    }
    Ok(plugin)
}


#[cfg(test)]
mod tests {
    use super::test_plugins::registry;
    use super::*;
    use serde_json::json;

    fn record() -> Record {
        match json!({"cmd": "threat actor", "meta": {"pid": 42}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn binds_literals_field_refs_and_rawdata() {
        let rec = record();
        let args = bind_args(
            &[
                ArgSpec::Literal(json!(7)),
                ArgSpec::FieldRef("meta.pid".to_string()),
                ArgSpec::FieldRef("missing".to_string()),
                ArgSpec::RawData,
            ],
            &rec,
        );
        assert_eq!(args[0], json!(7));
        assert_eq!(args[1], json!(42));
        assert_eq!(args[2], json!(""));
        assert_eq!(args[3], Value::Object(rec.clone()));
    }

    #[tokio::test]
    async fn negation_inverts_bool_result() {
        let registry = registry();
        let plugin = resolve_plugin(&registry, "contains_threat", true).unwrap();
        let call = BoundPluginCall {
            name: "contains_threat".to_string(),
            negated: true,
            args: vec![ArgSpec::FieldRef("cmd".to_string())],
            plugin,
        };
        assert!(!call.eval_bool(&record()).await.unwrap());
    }

    #[test]
    fn draft_and_missing_plugins_are_rejected() {
        let registry = registry();
        assert!(resolve_plugin(&registry, "wip_scoring", false).is_err());
        assert!(resolve_plugin(&registry, "nope", false).is_err());
    }

    #[test]
    fn check_context_requires_bool_return() {
        let registry = registry();
        assert!(resolve_plugin(&registry, "tag_severity", true).is_err());
        assert!(resolve_plugin(&registry, "tag_severity", false).is_ok());
    }
}
