//! SIEM Rule Engine
//!
//! A streaming rule-evaluation engine for the SIEM platform. It consumes
//! structured event records from upstream channels, evaluates each record
//! against a declaratively specified ruleset, and forwards matching records
//! (DETECTION) or records that survived a whitelist filter (WHITELIST) to
//! every downstream channel. Rules may also rewrite records on the way
//! through: appending fields, deleting them, or replacing the whole record
//! via a plugin.
//!
//! # Features
//!
//! - **Declarative Rulesets**: XML-like rule source with line-accurate
//!   validation diagnostics and a dry-run validation entry point
//! - **Rich Predicates**: prefix/suffix/substring/equality matching with
//!   case-insensitive variants, numeric comparison, null probes, regexes
//!   and boolean plugin checks
//! - **Checklist Conditions**: boolean formulas (`and`/`or`/`not`) over
//!   named check nodes, evaluated cheapest-first
//! - **Windowed Thresholds**: sliding-window counting per group key with
//!   EVENTS/SUM/CLASSIFY modes and interchangeable local (in-process LRU)
//!   and remote (key/value store) backends
//! - **Elastic Runtime**: per-channel consumers feeding a semaphore-backed
//!   worker pool, backlog-driven auto-scaling, QPS accounting and a
//!   drain-aware shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Upstream   │───▶│    Engine    │───▶│  Downstream  │
//! │   Channels   │    │  WorkerPool  │    │   Channels   │
//! └──────────────┘    └──────┬───────┘    └──────────────┘
//!                            │ per record
//!                     ┌──────▼───────┐
//!                     │   Ruleset    │  rules in declaration order
//!                     │   Executor   │  check / checklist / threshold
//!                     └──────┬───────┘  append / del / plugin
//!                            │
//!              ┌─────────────┼──────────────┐
//!       ┌──────▼─────┐ ┌─────▼──────┐ ┌─────▼──────┐
//!       │   Match    │ │ Threshold  │ │   Plugin   │
//!       │ Primitives │ │ Aggregator │ │  Registry  │
//!       └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use siem_rule_engine::{
//!     config::EngineConfig,
//!     engine::{Engine, RecordQueue},
//!     plugin::PluginRegistry,
//!     ruleset::{BuildContext, Ruleset},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = r#"
//!         <root type="DETECTION" name="demo" author="secops">
//!           <rule id="R1" name="curl to known bad">
//!             <check type="INCL" field="cmd">evil.tld</check>
//!           </rule>
//!         </root>"#;
//!
//!     let ctx = BuildContext::new(Arc::new(PluginRegistry::new()));
//!     let ruleset = Arc::new(Ruleset::build("demo", source, &ctx)?);
//!
//!     let upstream = RecordQueue::new("in");
//!     let downstream = RecordQueue::new("out");
//!     let mut engine = Engine::new(ruleset, EngineConfig::default())?;
//!     engine.bind_upstream(upstream.clone());
//!     engine.bind_downstream(downstream.clone());
//!
//!     engine.start().await?;
//!     // ... feed records into `upstream`, read hits from `downstream` ...
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`ruleset`] - Ruleset/rule data model and build entry points
//! - [`parser`] - XML-like source parsing and semantic validation
//! - [`executor`] - Per-record rule and ruleset execution
//! - [`matcher`] - String/numeric match primitives
//! - [`condition`] - Boolean condition AST for checklists
//! - [`threshold`] - Sliding-window threshold aggregation
//! - [`plugin`] - Plugin trait, registry and argument binding
//! - [`kv`] - Remote key/value store interface for thresholds
//! - [`record`] - Record model, field-path accessor and field cache
//! - [`engine`] - Channel binding, worker pool and runtime lifecycle
//! - [`metrics`] - Processing counters and QPS computation
//! - [`config`] - Engine tuning knobs
//! - [`error`] - Error types shared across the crate

pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod kv;
pub mod matcher;
pub mod metrics;
pub mod parser;
pub mod plugin;
pub mod record;
pub mod ruleset;
pub mod threshold;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{DailyStats, Engine, RecordQueue, Sampler, WorkerPool};
    pub use crate::error::{EngineError, Result};
    pub use crate::kv::{MemoryKv, RedisKv, RemoteKv};
    pub use crate::matcher::MatchType;
    pub use crate::parser::{validate, Diagnostic, ValidationResult};
    pub use crate::plugin::{ArgSpec, Plugin, PluginRegistry};
    pub use crate::record::{lookup_string, lookup_value, Record};
    pub use crate::ruleset::{BuildContext, Ruleset, RulesetDef, RulesetMode, HIT_RULE_FIELD};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_is_populated() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "siem_rule_engine");
    }
}
