use serde_json::Value;
use tracing::warn;

use crate::matcher::{string_match, MatchType};
use crate::record::Record;
use crate::record::{
    acquire_field_cache, delete_field, release_field_cache, set_field, FieldCache,
    FIELD_REF_PREFIX, RAW_DATA_TOKEN,
};
use crate::ruleset::{
    Append, AppendValue, CheckMode, CheckNode, Checklist, OpKind, Rule, Ruleset, RulesetMode,
    HIT_RULE_FIELD,
};
use crate::threshold::ThresholdState;

/// Resolve a comparison/append value: a `_$`-prefixed value is read from
/// the record at evaluation time, anything else passes through.
fn resolve_needle(value: &str, record: &Record, cache: &mut FieldCache) -> String {
    if value.starts_with(FIELD_REF_PREFIX) {
        cache.lookup(record, value).0
    } else {
        value.to_string()
    }
}

fn eval_primitive(
    node: &CheckNode,
    haystack: &str,
    raw_value: &str,
    record: &Record,
    cache: &mut FieldCache,
) -> bool {
    if node.match_type == MatchType::Regex {
        return node
            .regex
            .as_ref()
            .map(|re| re.is_match(haystack))
            .unwrap_or(false);
    }
    let needle = resolve_needle(raw_value, record, cache);
    string_match(node.match_type, haystack, &needle)
}

/// Evaluate one check node against the record.
pub(crate) async fn eval_check_node(
    node: &CheckNode,
    record: &Record,
    cache: &mut FieldCache,
) -> bool {
    if node.match_type == MatchType::Plugin {
        let Some(call) = &node.plugin else {
            return false;
        };
        return match call.eval_bool(record).await {
            Ok(result) => result,
            Err(e) => {
                warn!(plugin = %call.name, error = %e, "check plugin failed");
                false
            }
        };
    }

    let (haystack, _) = cache.lookup(record, &node.field);
    match node.mode {
        CheckMode::Single => eval_primitive(node, &haystack, &node.value, record, cache),
        CheckMode::And => {
            for item in &node.split_values {
                if !eval_primitive(node, &haystack, item, record, cache) {
                    return false;
                }
            }
            true
        }
        CheckMode::Or => {
            for item in &node.split_values {
                if eval_primitive(node, &haystack, item, record, cache) {
                    return true;
                }
            }
            false
        }
    }
}

async fn eval_checklist(checklist: &Checklist, record: &Record, cache: &mut FieldCache) -> bool {
    match &checklist.ast {
        Some(ast) => {
            let mut results = std::collections::HashMap::with_capacity(checklist.nodes.len());
            for node in &checklist.nodes {
                let result = eval_check_node(node, record, cache).await;
                results.insert(node.id.clone(), result);
            }
            ast.evaluate(&results)
        }
        None => {
            for node in &checklist.nodes {
                if !eval_check_node(node, record, cache).await {
                    return false;
                }
            }
            true
        }
    }
}

async fn apply_append(append: &Append, working: &mut Record, cache: &mut FieldCache) {
    match &append.value {
        AppendValue::Literal(value) => {
            let resolved = resolve_needle(value, working, cache);
            set_field(working, &append.field, Value::String(resolved));
        }
        AppendValue::Plugin(call) => match call.eval_value(working).await {
            Ok(Some(value)) => {
                if append.field == RAW_DATA_TOKEN {
                    match value {
                        Value::Object(map) => *working = map,
                        other => {
                            warn!(
                                plugin = %call.name,
                                got = %type_name(&other),
                                "whole-record append needs a map return; dropping result"
                            );
                        }
                    }
                } else {
                    set_field(working, &append.field, value);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(plugin = %call.name, error = %e, "append plugin failed; skipping");
            }
        },
    }
    cache.clear();
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Execute one rule's operation queue against `record`.
///
/// Returns the boolean result plus the mutated working copy when the rule
/// carries mutating operations (`None` means the record is unchanged). In
/// DETECTION mode the first failing check-like operation aborts the queue;
/// in WHITELIST mode the whole queue runs and the result is the AND of all
/// check-like results.
pub(crate) async fn execute_rule(
    ruleset: &Ruleset,
    rule: &Rule,
    record: &Record,
) -> (bool, Option<Record>) {
    let mut working: Option<Record> = if rule.mutates {
        Some(record.clone())
    } else {
        None
    };
    let mut cache = acquire_field_cache();
    let state = ThresholdState {
        counter: ruleset.counter_cache.as_ref(),
        classify: ruleset.classify_index.as_ref(),
        kv: ruleset.remote_kv.as_ref(),
    };
    let mode = ruleset.def.mode;
    let mut matched = true;

    for op in &rule.ops {
        let passed = match op.kind {
            OpKind::Check => {
                let rec = working.as_ref().unwrap_or(record);
                Some(eval_check_node(&rule.checks[op.index], rec, &mut cache).await)
            }
            OpKind::Checklist => {
                let rec = working.as_ref().unwrap_or(record);
                Some(eval_checklist(&rule.checklists[op.index], rec, &mut cache).await)
            }
            OpKind::Threshold => {
                let rec = working.as_ref().unwrap_or(record);
                Some(
                    rule.thresholds[op.index]
                        .evaluate(&state, rec, &mut cache)
                        .await,
                )
            }
            OpKind::Append => {
                if let Some(working) = working.as_mut() {
                    apply_append(&rule.appends[op.index], working, &mut cache).await;
                }
                None
            }
            OpKind::Del => {
                if let Some(working) = working.as_mut() {
                    for field in &rule.dels[op.index].fields {
                        delete_field(working, field);
                    }
                    cache.clear();
                }
                None
            }
            OpKind::Plugin => {
                let rec = working.as_ref().unwrap_or(record);
                rule.plugins[op.index].invoke(rec).await;
                None
            }
        };

        if let Some(false) = passed {
            matched = false;
            if mode == RulesetMode::Detection {
                release_field_cache(cache);
                return (false, working);
            }
        }
    }

    release_field_cache(cache);
    (matched, working)
}

/// Record the firing rule on the output record, comma-appending when an
/// upstream stage already stamped it.
fn stamp_hit(record: &mut Record, hit: &str) {
    match record.get_mut(HIT_RULE_FIELD) {
        Some(Value::String(existing)) if !existing.is_empty() => {
            existing.push(',');
            existing.push_str(hit);
        }
        _ => {
            record.insert(HIT_RULE_FIELD.to_string(), Value::String(hit.to_string()));
        }
    }
}

impl Ruleset {
    /// Apply every rule to `record` in declaration order and produce the
    /// output records for this ruleset's mode.
    ///
    /// DETECTION emits one stamped record per matching rule. WHITELIST
    /// drops the record when any rule matches, passes it through unchanged
    /// when the ruleset is empty, and otherwise forwards the last rule's
    /// working copy.
    pub async fn evaluate(&self, record: &Record) -> Vec<Record> {
        match self.def.mode {
            RulesetMode::Detection => {
                let mut outputs = Vec::new();
                for rule in &self.def.rules {
                    self.count_evaluated();
                    let (matched, modified) = execute_rule(self, rule, record).await;
                    if matched {
                        self.count_matched();
                        let mut output = modified.unwrap_or_else(|| record.clone());
                        stamp_hit(&mut output, &format!("{}.{}", self.def.id, rule.id));
                        outputs.push(output);
                    }
                }
                outputs
            }
            RulesetMode::Whitelist => {
                if self.def.rules.is_empty() {
                    return vec![record.clone()];
                }
                let mut last: Option<Record> = None;
                for rule in &self.def.rules {
                    self.count_evaluated();
                    let (matched, modified) = execute_rule(self, rule, record).await;
                    if matched {
                        self.count_matched();
                        return Vec::new();
                    }
                    last = Some(modified.unwrap_or_else(|| record.clone()));
                }
                last.map(|rec| vec![rec]).unwrap_or_default()
            }
        }
    }
}
