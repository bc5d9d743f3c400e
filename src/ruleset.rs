use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::condition::CondExpr;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::kv::RemoteKv;
use crate::matcher::MatchType;
use crate::parser;
use crate::plugin::{BoundPluginCall, PluginRegistry};
use crate::threshold::{ClassifyIndex, CounterCache};

/// Reserved output field carrying `rulesetID.ruleID` for every rule that
/// fired, comma-joined when several did.
pub const HIT_RULE_FIELD: &str = "_hub_hit_rule_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RulesetMode {
    /// Emit records that match a rule.
    Detection,
    /// Drop records that match a rule; forward the rest.
    Whitelist,
}

impl RulesetMode {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "DETECTION" => Some(RulesetMode::Detection),
            "WHITELIST" => Some(RulesetMode::Whitelist),
            _ => None,
        }
    }
}

/// How a check combines its comparison value(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckMode {
    Single,
    And,
    Or,
}

/// One atomic predicate over a field.
#[derive(Debug, Clone)]
pub struct CheckNode {
    /// Node id; required and unique when the enclosing checklist uses a
    /// condition formula.
    pub id: String,
    pub match_type: MatchType,
    pub field: String,
    pub value: String,
    pub mode: CheckMode,
    pub delimiter: String,
    /// `value` split on `delimiter` when `mode != SINGLE`.
    pub split_values: Vec<String>,
    pub regex: Option<Regex>,
    pub plugin: Option<BoundPluginCall>,
    /// Source line, kept for diagnostics.
    pub line: usize,
}

/// A group of check nodes combined by AND or by a boolean formula over
/// node ids.
#[derive(Debug, Clone)]
pub struct Checklist {
    pub condition: Option<String>,
    pub ast: Option<CondExpr>,
    /// Nodes in evaluation order (reordered by cost tier at build; source
    /// order is preserved at the operation-queue level only).
    pub nodes: Vec<CheckNode>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CountType {
    /// Count records.
    Events,
    /// Sum an integer field.
    Sum,
    /// Count distinct values of a field.
    Classify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdBackend {
    /// In-process TTL'd counter cache.
    Local,
    /// External key/value store.
    Remote,
}

/// A sliding-window counter that fires when the configured aggregate
/// passes `value`, then resets its window.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub group_by: Vec<String>,
    pub window: Duration,
    pub backend: ThresholdBackend,
    pub count_type: CountType,
    /// Required for SUM and CLASSIFY.
    pub count_field: Option<String>,
    pub value: u64,
    /// Deterministic per-threshold key prefix (`ruleset.rule.op`).
    pub key_prefix: String,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum AppendValue {
    /// A literal, `_$path` sentinels resolved at evaluation time.
    Literal(String),
    Plugin(BoundPluginCall),
}

#[derive(Debug, Clone)]
pub struct Append {
    /// Target field name; the `_$ORIDATA` sentinel replaces the whole
    /// working record (map-returning plugins only).
    pub field: String,
    pub value: AppendValue,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct Del {
    pub fields: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Check,
    Checklist,
    Threshold,
    Append,
    Del,
    Plugin,
}

/// One entry of a rule's ordered operation queue: the kind plus an index
/// into the matching side table.
#[derive(Debug, Clone, Copy)]
pub struct RuleOp {
    pub kind: OpKind,
    pub index: usize,
}

/// A rule: an id plus the source-ordered operation queue over six side
/// tables.
#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub ops: Vec<RuleOp>,
    pub checks: Vec<CheckNode>,
    pub checklists: Vec<Checklist>,
    pub thresholds: Vec<Threshold>,
    pub appends: Vec<Append>,
    pub dels: Vec<Del>,
    pub plugins: Vec<BoundPluginCall>,
    /// True when the queue contains APPEND/DEL/PLUGIN; decides whether the
    /// executor needs a private working copy of the record.
    pub mutates: bool,
    pub line: usize,
}

impl Rule {
    pub fn has_check_ops(&self) -> bool {
        self.ops.iter().any(|op| {
            matches!(
                op.kind,
                OpKind::Check | OpKind::Checklist | OpKind::Threshold
            )
        })
    }
}

/// Immutable ruleset definition: built once from source, shared read-only
/// between instances.
#[derive(Debug)]
pub struct RulesetDef {
    pub id: String,
    pub name: String,
    pub author: String,
    pub mode: RulesetMode,
    pub rules: Vec<Rule>,
    /// Raw source text the definition was built from.
    pub raw: String,
}

impl RulesetDef {
    pub fn has_threshold(&self) -> bool {
        self.rules.iter().any(|r| !r.thresholds.is_empty())
    }

    pub fn has_classify_threshold(&self) -> bool {
        self.rules.iter().any(|r| {
            r.thresholds
                .iter()
                .any(|t| t.count_type == CountType::Classify)
        })
    }
}

/// Everything a ruleset build needs from the host: the plugin registry and
/// (when remote thresholds are used) the KV store. Injected, never global.
#[derive(Clone)]
pub struct BuildContext {
    pub plugins: Arc<PluginRegistry>,
    pub remote_kv: Option<Arc<dyn RemoteKv>>,
    pub local_cache_max_entries: u64,
    pub local_cache_max_cost: u64,
}

impl BuildContext {
    pub fn new(plugins: Arc<PluginRegistry>) -> Self {
        let defaults = EngineConfig::default();
        BuildContext {
            plugins,
            remote_kv: None,
            local_cache_max_entries: defaults.local_cache_max_entries,
            local_cache_max_cost: defaults.local_cache_max_cost,
        }
    }

    pub fn with_remote_kv(mut self, kv: Arc<dyn RemoteKv>) -> Self {
        self.remote_kv = Some(kv);
        self
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.local_cache_max_entries = config.local_cache_max_entries;
        self.local_cache_max_cost = config.local_cache_max_cost;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesetStats {
    pub rules_evaluated: u64,
    pub rules_matched: u64,
}

/// A built ruleset plus its shared runtime state: the threshold caches
/// (created exactly when a threshold / CLASSIFY threshold exists) and the
/// evaluation counters. Separate instances of the same definition share
/// rules but not runtime state.
pub struct Ruleset {
    pub def: Arc<RulesetDef>,
    pub(crate) counter_cache: Option<Arc<CounterCache>>,
    pub(crate) classify_index: Option<Arc<ClassifyIndex>>,
    pub(crate) remote_kv: Option<Arc<dyn RemoteKv>>,
    rules_evaluated: AtomicU64,
    rules_matched: AtomicU64,
}

impl Ruleset {
    /// Parse, validate, bind plugins, compile regexes and initialize the
    /// shared caches. The returned ruleset is read-only.
    pub fn build(id: &str, source: &str, ctx: &BuildContext) -> Result<Ruleset> {
        let outcome = parser::build_ruleset(id, source, ctx);
        let def = match outcome.def {
            Some(def) if outcome.result.ok => def,
            _ => return Err(EngineError::RulesetInvalid(outcome.result.errors)),
        };
        Ok(Self::from_def(Arc::new(def), ctx))
    }

    /// Instantiate runtime state for an already-built definition.
    pub fn from_def(def: Arc<RulesetDef>, ctx: &BuildContext) -> Ruleset {
        let counter_cache = if def.has_threshold() {
            Some(Arc::new(CounterCache::new(
                ctx.local_cache_max_entries,
                ctx.local_cache_max_cost,
            )))
        } else {
            None
        };
        let classify_index = if def.has_classify_threshold() {
            Some(Arc::new(ClassifyIndex::new(ctx.local_cache_max_entries)))
        } else {
            None
        };
        Ruleset {
            def,
            counter_cache,
            classify_index,
            remote_kv: ctx.remote_kv.clone(),
            rules_evaluated: AtomicU64::new(0),
            rules_matched: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn mode(&self) -> RulesetMode {
        self.def.mode
    }

    pub(crate) fn count_evaluated(&self) {
        self.rules_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_matched(&self) {
        self.rules_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RulesetStats {
        RulesetStats {
            rules_evaluated: self.rules_evaluated.load(Ordering::Relaxed),
            rules_matched: self.rules_matched.load(Ordering::Relaxed),
        }
    }

    /// Flush pending cache maintenance. Called on engine stop.
    pub async fn close(&self) {
        if let Some(cache) = &self.counter_cache {
            cache.close().await;
        }
        if let Some(index) = &self.classify_index {
            index.close().await;
        }
    }
}

impl std::fmt::Debug for Ruleset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ruleset")
            .field("id", &self.def.id)
            .field("mode", &self.def.mode)
            .field("rules", &self.def.rules.len())
            .field("counter_cache", &self.counter_cache.is_some())
            .field("classify_index", &self.classify_index.is_some())
            .finish()
    }
}
