use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use siem_rule_engine::error::{EngineError, Result};
use siem_rule_engine::plugin::{Plugin, PluginRegistry};
use siem_rule_engine::record::Record;
use siem_rule_engine::ruleset::{BuildContext, Ruleset};

/// `is_private_ip(value)` — bool plugin for check contexts.
pub struct IsPrivateIp;

#[async_trait]
impl Plugin for IsPrivateIp {
    fn name(&self) -> &str {
        "is_private_ip"
    }

    fn returns_bool(&self) -> bool {
        true
    }

    async fn eval_bool(&self, args: &[Value]) -> Result<bool> {
        let Some(Value::String(ip)) = args.first() else {
            return Err(EngineError::plugin("is_private_ip expects a string"));
        };
        Ok(ip.starts_with("10.") || ip.starts_with("192.168.") || ip.starts_with("172.16."))
    }

    async fn eval_value(&self, _args: &[Value]) -> Result<Option<Value>> {
        Err(EngineError::plugin("is_private_ip only returns bool"))
    }
}

/// `const_value(x)` — returns its argument; append-context plugin.
pub struct ConstValue;

#[async_trait]
impl Plugin for ConstValue {
    fn name(&self) -> &str {
        "const_value"
    }

    fn returns_bool(&self) -> bool {
        false
    }

    async fn eval_bool(&self, _args: &[Value]) -> Result<bool> {
        Err(EngineError::plugin("const_value does not return bool"))
    }

    async fn eval_value(&self, args: &[Value]) -> Result<Option<Value>> {
        Ok(args.first().cloned())
    }
}

#[allow(dead_code)]
pub fn registry() -> Arc<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(IsPrivateIp));
    registry.register(Arc::new(ConstValue));
    registry.register_draft("unsaved_enrich");
    Arc::new(registry)
}

#[allow(dead_code)]
pub fn build_context() -> BuildContext {
    BuildContext::new(registry())
}

#[allow(dead_code)]
pub fn build_ruleset(id: &str, mode: &str, body: &str) -> Ruleset {
    let source = format!("<root type=\"{}\" name=\"test\">{}</root>", mode, body);
    Ruleset::build(id, &source, &build_context()).expect("ruleset builds")
}

#[allow(dead_code)]
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => panic!("test record must be an object"),
    }
}
