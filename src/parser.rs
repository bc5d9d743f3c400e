use std::collections::{HashMap, HashSet};

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use tracing::debug;

use crate::condition::parse_condition;
use crate::matcher::MatchType;
use crate::plugin::{resolve_plugin, ArgSpec, BoundPluginCall};
use crate::record::RAW_DATA_TOKEN;
use crate::ruleset::{
    Append, AppendValue, BuildContext, CheckMode, CheckNode, Checklist, CountType, Del, OpKind,
    Rule, RuleOp, RulesetDef, RulesetMode, Threshold, ThresholdBackend,
};

/// One structured validation finding, anchored to a source line.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub line: usize,
    pub message: String,
    pub detail: String,
}

impl Diagnostic {
    fn new(line: usize, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Diagnostic {
            line,
            message: message.into(),
            detail: detail.into(),
        }
    }
}

/// Outcome of a dry-run validation: structured errors and warnings, no
/// runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

/// Outcome of a full build: the definition (usable when `result.ok`) plus
/// every diagnostic gathered along the way.
pub struct BuildOutcome {
    pub def: Option<RulesetDef>,
    pub result: ValidationResult,
}

#[derive(Debug, Default)]
struct RawElement {
    name: String,
    attrs: HashMap<String, String>,
    text: String,
    children: Vec<RawElement>,
    line: usize,
}

impl RawElement {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    fn trimmed_text(&self) -> &str {
        self.text.trim()
    }
}

/// Tokenise the XML-like source into a raw element tree, tracking the line
/// of every start element by counting newlines in the character data
/// between tokens.
fn parse_raw(source: &str) -> Result<RawElement, Diagnostic> {
    let mut reader = Reader::from_str(source);
    let bytes = source.as_bytes();
    let mut line = 1usize;
    let mut consumed = 0usize;
    let mut stack: Vec<RawElement> = Vec::new();
    let mut root: Option<RawElement> = None;

    loop {
        let event = reader.read_event();
        let position = reader.buffer_position().min(bytes.len());
        let event_line = line;
        line += bytes[consumed..position]
            .iter()
            .filter(|b| **b == b'\n')
            .count();
        consumed = position;

        match event {
            Ok(Event::Start(start)) => {
                let element = read_element(&start, event_line)?;
                stack.push(element);
            }
            Ok(Event::Empty(start)) => {
                let element = read_element(&start, event_line)?;
                attach(element, &mut stack, &mut root, event_line)?;
            }
            Ok(Event::End(_)) => {
                let Some(element) = stack.pop() else {
                    return Err(Diagnostic::new(
                        event_line,
                        "unbalanced closing tag",
                        String::new(),
                    ));
                };
                attach(element, &mut stack, &mut root, event_line)?;
            }
            Ok(Event::Text(text)) => {
                if let Some(top) = stack.last_mut() {
                    let unescaped = text.unescape().map_err(|e| {
                        Diagnostic::new(event_line, "invalid character data", e.to_string())
                    })?;
                    top.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Diagnostic::new(
                    event_line,
                    "malformed ruleset source",
                    e.to_string(),
                ));
            }
        }
    }

    if !stack.is_empty() {
        return Err(Diagnostic::new(
            line,
            "unterminated element",
            stack.last().map(|e| e.name.clone()).unwrap_or_default(),
        ));
    }
    root.ok_or_else(|| Diagnostic::new(1, "ruleset source has no root element", String::new()))
}

fn read_element(
    start: &quick_xml::events::BytesStart<'_>,
    line: usize,
) -> Result<RawElement, Diagnostic> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = HashMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Diagnostic::new(line, "malformed attribute", e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Diagnostic::new(line, "malformed attribute value", e.to_string()))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(RawElement {
        name,
        attrs,
        text: String::new(),
        children: Vec::new(),
        line,
    })
}

fn attach(
    element: RawElement,
    stack: &mut Vec<RawElement>,
    root: &mut Option<RawElement>,
    line: usize,
) -> Result<(), Diagnostic> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(Diagnostic::new(
                    line,
                    "multiple top-level elements",
                    element.name,
                ));
            }
            *root = Some(element);
            Ok(())
        }
    }
}

struct Diags {
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
}

impl Diags {
    fn new() -> Self {
        Diags {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn error(&mut self, line: usize, message: impl Into<String>, detail: impl Into<String>) {
        self.errors.push(Diagnostic::new(line, message, detail));
    }

    fn warning(&mut self, line: usize, message: impl Into<String>, detail: impl Into<String>) {
        self.warnings.push(Diagnostic::new(line, message, detail));
    }
}

/// Dry-run validation: parse and semantically check `source` without
/// allocating any runtime state.
pub fn validate(source: &str, ctx: &BuildContext) -> ValidationResult {
    build_ruleset("validate", source, ctx).result
}

/// Parse `source` and build the ruleset definition, gathering structured
/// diagnostics. `def` is only meaningful when `result.ok`.
pub fn build_ruleset(ruleset_id: &str, source: &str, ctx: &BuildContext) -> BuildOutcome {
    let raw = match parse_raw(source) {
        Ok(raw) => raw,
        Err(diag) => {
            return BuildOutcome {
                def: None,
                result: ValidationResult {
                    ok: false,
                    errors: vec![diag],
                    warnings: Vec::new(),
                },
            };
        }
    };

    let mut diags = Diags::new();

    if raw.name != "root" {
        diags.error(
            raw.line,
            format!("top element must be <root>, found <{}>", raw.name),
            String::new(),
        );
    }

    let mode = match raw.attr("type") {
        Some(token) => match RulesetMode::parse(token) {
            Some(mode) => mode,
            None => {
                diags.error(
                    raw.line,
                    format!("unknown ruleset type: {}", token),
                    "expected DETECTION or WHITELIST",
                );
                RulesetMode::Detection
            }
        },
        None => {
            diags.error(raw.line, "ruleset type attribute is missing", String::new());
            RulesetMode::Detection
        }
    };

    let name = raw.attr("name").unwrap_or_default().to_string();
    let author = raw.attr("author").unwrap_or_default().to_string();

    let mut rules = Vec::new();
    let mut seen_rule_ids = HashSet::new();
    for child in &raw.children {
        if child.name != "rule" {
            diags.error(
                child.line,
                format!("unsupported element <{}> at ruleset level", child.name),
                String::new(),
            );
            continue;
        }
        if let Some(rule) = build_rule(ruleset_id, child, mode, ctx, &mut diags) {
            if !seen_rule_ids.insert(rule.id.clone()) {
                diags.error(
                    child.line,
                    format!("duplicate rule id: {}", rule.id),
                    String::new(),
                );
                continue;
            }
            rules.push(rule);
        }
    }

    let ok = diags.errors.is_empty();
    debug!(
        ruleset = ruleset_id,
        rules = rules.len(),
        errors = diags.errors.len(),
        warnings = diags.warnings.len(),
        "ruleset build finished"
    );
    BuildOutcome {
        def: ok.then(|| RulesetDef {
            id: ruleset_id.to_string(),
            name,
            author,
            mode,
            rules,
            raw: source.to_string(),
        }),
        result: ValidationResult {
            ok,
            errors: diags.errors,
            warnings: diags.warnings,
        },
    }
}

fn build_rule(
    ruleset_id: &str,
    elem: &RawElement,
    mode: RulesetMode,
    ctx: &BuildContext,
    diags: &mut Diags,
) -> Option<Rule> {
    let id = match elem.attr("id") {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => {
            diags.error(elem.line, "rule id is missing", String::new());
            return None;
        }
    };
    let name = elem.attr("name").unwrap_or_default().to_string();

    let mut rule = Rule {
        id: id.clone(),
        name,
        ops: Vec::new(),
        checks: Vec::new(),
        checklists: Vec::new(),
        thresholds: Vec::new(),
        appends: Vec::new(),
        dels: Vec::new(),
        plugins: Vec::new(),
        mutates: false,
        line: elem.line,
    };

    for child in &elem.children {
        let op_index = rule.ops.len();
        match child.name.as_str() {
            "check" => {
                if let Some(node) = build_check_node(child, ctx, diags) {
                    rule.ops.push(RuleOp {
                        kind: OpKind::Check,
                        index: rule.checks.len(),
                    });
                    rule.checks.push(node);
                }
            }
            "checklist" => {
                if !rule.checklists.is_empty() {
                    diags.error(
                        child.line,
                        format!("rule {} has more than one checklist", id),
                        String::new(),
                    );
                    continue;
                }
                if let Some(checklist) = build_checklist(child, ctx, diags) {
                    rule.ops.push(RuleOp {
                        kind: OpKind::Checklist,
                        index: rule.checklists.len(),
                    });
                    rule.checklists.push(checklist);
                }
            }
            "threshold" => {
                if let Some(threshold) =
                    build_threshold(ruleset_id, &id, op_index, child, ctx, diags)
                {
                    rule.ops.push(RuleOp {
                        kind: OpKind::Threshold,
                        index: rule.thresholds.len(),
                    });
                    rule.thresholds.push(threshold);
                }
            }
            "append" => {
                if let Some(append) = build_append(child, ctx, diags) {
                    rule.ops.push(RuleOp {
                        kind: OpKind::Append,
                        index: rule.appends.len(),
                    });
                    rule.appends.push(append);
                }
            }
            "plugin" => {
                match parse_plugin_call(child.trimmed_text(), false, ctx, child.line, diags) {
                    Some(call) => {
                        rule.ops.push(RuleOp {
                            kind: OpKind::Plugin,
                            index: rule.plugins.len(),
                        });
                        rule.plugins.push(call);
                    }
                    None => continue,
                }
            }
            "del" => {
                if !rule.dels.is_empty() {
                    diags.error(
                        child.line,
                        format!("rule {} has more than one del", id),
                        String::new(),
                    );
                    continue;
                }
                let fields: Vec<String> = child
                    .trimmed_text()
                    .split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect();
                if fields.is_empty() {
                    diags.error(
                        child.line,
                        format!("del in rule {} lists no fields", id),
                        String::new(),
                    );
                    continue;
                }
                rule.ops.push(RuleOp {
                    kind: OpKind::Del,
                    index: rule.dels.len(),
                });
                rule.dels.push(Del {
                    fields,
                    line: child.line,
                });
            }
            "filter" => {
                diags.error(
                    child.line,
                    format!("legacy <filter> in rule {} is not supported", id),
                    "rewrite it as a <check>",
                );
            }
            other => {
                diags.error(
                    child.line,
                    format!("unsupported element <{}> in rule {}", other, id),
                    String::new(),
                );
            }
        }
    }

    if !rule.has_check_ops() {
        diags.error(
            elem.line,
            format!(
                "rule {} needs at least one check, checklist or threshold",
                id
            ),
            String::new(),
        );
    }
    if mode == RulesetMode::Whitelist && !rule.thresholds.is_empty() {
        diags.warning(
            elem.line,
            format!("rule {} uses a threshold in a WHITELIST ruleset", id),
            "whitelist thresholds pass records until the window fires",
        );
    }

    rule.mutates = rule
        .ops
        .iter()
        .any(|op| matches!(op.kind, OpKind::Append | OpKind::Del | OpKind::Plugin));
    Some(rule)
}

fn build_check_node(elem: &RawElement, ctx: &BuildContext, diags: &mut Diags) -> Option<CheckNode> {
    let type_token = match elem.attr("type") {
        Some(token) if !token.is_empty() => token,
        _ => {
            diags.error(elem.line, "check type attribute is missing", String::new());
            return None;
        }
    };
    let match_type = match MatchType::parse(type_token) {
        Some(mt) => mt,
        None => {
            diags.error(
                elem.line,
                format!("unknown check type: {}", type_token),
                String::new(),
            );
            return None;
        }
    };

    let field = elem.attr("field").unwrap_or_default().trim().to_string();
    if field.is_empty() && match_type != MatchType::Plugin {
        diags.error(
            elem.line,
            format!(
                "check of type {} needs a field attribute",
                match_type.as_str()
            ),
            String::new(),
        );
        return None;
    }

    let value = elem.trimmed_text().to_string();
    let id = elem.attr("id").unwrap_or_default().trim().to_string();

    let mut mode = CheckMode::Single;
    let mut delimiter = String::new();
    let mut split_values = Vec::new();
    if let Some(logic) = elem.attr("logic") {
        mode = match logic {
            "AND" => CheckMode::And,
            "OR" => CheckMode::Or,
            other => {
                diags.error(
                    elem.line,
                    format!("unknown check logic: {}", other),
                    "expected AND or OR",
                );
                return None;
            }
        };
        if matches!(match_type, MatchType::Regex | MatchType::Plugin) {
            diags.error(
                elem.line,
                format!("check type {} does not support logic", match_type.as_str()),
                String::new(),
            );
            return None;
        }
        delimiter = elem.attr("delimiter").unwrap_or_default().to_string();
        if delimiter.is_empty() {
            diags.error(
                elem.line,
                "check logic needs a delimiter attribute",
                String::new(),
            );
            return None;
        }
        split_values = value
            .split(delimiter.as_str())
            .map(str::to_string)
            .collect();
    }

    let mut regex = None;
    let mut plugin = None;
    match match_type {
        MatchType::Regex => {
            if value.is_empty() {
                diags.error(elem.line, "REGEX check has no pattern", String::new());
                return None;
            }
            match crate::matcher::compile_regex(&value) {
                Ok(compiled) => regex = Some(compiled),
                Err(e) => {
                    diags.error(elem.line, "REGEX pattern does not compile", e.to_string());
                    return None;
                }
            }
        }
        MatchType::Plugin => {
            plugin = parse_plugin_call(&value, true, ctx, elem.line, diags);
            plugin.as_ref()?;
        }
        _ => {
            if value.is_empty() && match_type.requires_value() {
                diags.warning(
                    elem.line,
                    format!("check of type {} has an empty value", match_type.as_str()),
                    String::new(),
                );
            }
        }
    }

    Some(CheckNode {
        id,
        match_type,
        field,
        value,
        mode,
        delimiter,
        split_values,
        regex,
        plugin,
        line: elem.line,
    })
}

fn build_checklist(elem: &RawElement, ctx: &BuildContext, diags: &mut Diags) -> Option<Checklist> {
    let mut nodes = Vec::new();
    for child in &elem.children {
        if child.name != "check" {
            diags.error(
                child.line,
                format!("unsupported element <{}> in checklist", child.name),
                String::new(),
            );
            continue;
        }
        if let Some(node) = build_check_node(child, ctx, diags) {
            nodes.push(node);
        }
    }
    if nodes.is_empty() {
        diags.error(elem.line, "checklist has no check nodes", String::new());
        return None;
    }

    let condition = elem
        .attr("condition")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let ast = if let Some(source) = &condition {
        let mut seen = HashSet::new();
        for node in &nodes {
            if node.id.is_empty() {
                diags.error(
                    node.line,
                    "checklist condition requires every check to carry an id",
                    String::new(),
                );
                return None;
            }
            if !seen.insert(node.id.clone()) {
                diags.error(
                    node.line,
                    format!("duplicate check id in checklist: {}", node.id),
                    String::new(),
                );
                return None;
            }
        }
        match parse_condition(source) {
            Ok(ast) => {
                for ident in ast.idents() {
                    if !seen.contains(ident) {
                        diags.warning(
                            elem.line,
                            format!("condition references unknown check id: {}", ident),
                            "it will evaluate to false",
                        );
                    }
                }
                Some(ast)
            }
            Err(e) => {
                diags.error(
                    elem.line,
                    "checklist condition does not parse",
                    e.to_string(),
                );
                return None;
            }
        }
    } else {
        None
    };

    // Cheapest-first evaluation inside the checklist; the operation queue
    // keeps source order.
    nodes.sort_by_key(|node| node.match_type.cost_tier());

    Some(Checklist {
        condition,
        ast,
        nodes,
        line: elem.line,
    })
}

fn build_threshold(
    ruleset_id: &str,
    rule_id: &str,
    op_index: usize,
    elem: &RawElement,
    ctx: &BuildContext,
    diags: &mut Diags,
) -> Option<Threshold> {
    let group_by: Vec<String> = elem
        .attr("group_by")
        .unwrap_or_default()
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if group_by.is_empty() {
        diags.error(
            elem.line,
            "threshold group_by attribute is missing",
            String::new(),
        );
        return None;
    }

    let window = match elem.attr("range") {
        Some(range) => match humantime::parse_duration(range.trim()) {
            Ok(window) if !window.is_zero() => window,
            Ok(_) => {
                diags.error(elem.line, "threshold range must be positive", String::new());
                return None;
            }
            Err(e) => {
                diags.error(
                    elem.line,
                    format!("threshold range does not parse: {}", range),
                    e.to_string(),
                );
                return None;
            }
        },
        None => {
            diags.error(
                elem.line,
                "threshold range attribute is missing",
                String::new(),
            );
            return None;
        }
    };

    let count_type = match elem.attr("count_type") {
        None | Some("") => CountType::Events,
        Some("SUM") => CountType::Sum,
        Some("CLASSIFY") => CountType::Classify,
        Some(other) => {
            diags.error(
                elem.line,
                format!("unknown threshold count_type: {}", other),
                "expected SUM or CLASSIFY",
            );
            return None;
        }
    };

    let count_field = elem
        .attr("count_field")
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string);
    if count_field.is_none() && count_type != CountType::Events {
        diags.error(
            elem.line,
            "threshold count_field is required for SUM and CLASSIFY",
            String::new(),
        );
        return None;
    }

    let backend = match elem.attr("local_cache") {
        Some("true") => ThresholdBackend::Local,
        Some("false") | None => ThresholdBackend::Remote,
        Some(other) => {
            diags.error(
                elem.line,
                format!("unknown local_cache value: {}", other),
                "expected true or false",
            );
            return None;
        }
    };
    if backend == ThresholdBackend::Remote && ctx.remote_kv.is_none() {
        diags.warning(
            elem.line,
            "remote threshold has no KV store bound",
            "it will fail closed at evaluation time",
        );
    }

    let value = match elem.trimmed_text().parse::<u64>() {
        Ok(value) if value >= 1 => value,
        Ok(_) => {
            diags.error(
                elem.line,
                "threshold value must be at least 1",
                String::new(),
            );
            return None;
        }
        Err(_) => {
            diags.error(
                elem.line,
                format!("threshold value is not an integer: {}", elem.trimmed_text()),
                String::new(),
            );
            return None;
        }
    };

    Some(Threshold {
        group_by,
        window,
        backend,
        count_type,
        count_field,
        value,
        key_prefix: format!("{}.{}.{}", ruleset_id, rule_id, op_index),
        line: elem.line,
    })
}

fn build_append(elem: &RawElement, ctx: &BuildContext, diags: &mut Diags) -> Option<Append> {
    let field = match elem.attr("field") {
        Some(field) if !field.trim().is_empty() => field.trim().to_string(),
        _ => {
            diags.error(elem.line, "append field attribute is missing", String::new());
            return None;
        }
    };

    let value = match elem.attr("type") {
        Some("PLUGIN") => {
            let call = parse_plugin_call(elem.trimmed_text(), false, ctx, elem.line, diags)?;
            AppendValue::Plugin(call)
        }
        None | Some("") => {
            if field == RAW_DATA_TOKEN {
                diags.error(
                    elem.line,
                    "whole-record append requires a plugin value",
                    String::new(),
                );
                return None;
            }
            AppendValue::Literal(elem.trimmed_text().to_string())
        }
        Some(other) => {
            diags.error(
                elem.line,
                format!("unknown append type: {}", other),
                "expected PLUGIN or no type",
            );
            return None;
        }
    };

    Some(Append {
        field,
        value,
        line: elem.line,
    })
}

/// Parse `!?ident(arg, …)` and resolve it against the plugin registry.
fn parse_plugin_call(
    source: &str,
    check_context: bool,
    ctx: &BuildContext,
    line: usize,
    diags: &mut Diags,
) -> Option<BoundPluginCall> {
    let call = match parse_call_syntax(source) {
        Ok(call) => call,
        Err(detail) => {
            diags.error(
                line,
                format!("plugin call does not parse: {}", source),
                detail,
            );
            return None;
        }
    };
    match resolve_plugin(&ctx.plugins, &call.0, check_context) {
        Ok(plugin) => Some(BoundPluginCall {
            name: call.0,
            negated: call.1,
            args: call.2,
            plugin,
        }),
        Err(e) => {
            diags.error(line, e.to_string(), String::new());
            None
        }
    }
}

fn parse_call_syntax(source: &str) -> Result<(String, bool, Vec<ArgSpec>), String> {
    let mut text = source.trim();
    if text.is_empty() {
        return Err("empty plugin call".to_string());
    }
    let negated = text.starts_with('!');
    if negated {
        text = text[1..].trim_start();
    }

    let open = text
        .find('(')
        .ok_or_else(|| "missing opening parenthesis".to_string())?;
    if !text.ends_with(')') {
        return Err("missing closing parenthesis".to_string());
    }
    let name = text[..open].trim();
    if name.is_empty()
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(format!("invalid plugin name: {}", name));
    }

    let inner = &text[open + 1..text.len() - 1];
    let mut args = Vec::new();
    for raw in split_args(inner)? {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty argument".to_string());
        }
        args.push(parse_arg(raw)?);
    }
    Ok((name.to_string(), negated, args))
}

/// Split an argument list on top-level commas, honouring quoted strings.
fn split_args(inner: &str) -> Result<Vec<String>, String> {
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in inner.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                ',' => {
                    args.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    args.push(current);
    Ok(args)
}

fn parse_arg(raw: &str) -> Result<ArgSpec, String> {
    if raw == RAW_DATA_TOKEN {
        return Ok(ArgSpec::RawData);
    }
    if let Some(stripped) = raw.strip_prefix("_$") {
        if stripped.is_empty() {
            return Err("empty field reference".to_string());
        }
        return Ok(ArgSpec::FieldRef(stripped.to_string()));
    }
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Ok(ArgSpec::Literal(serde_json::Value::String(
            raw[1..raw.len() - 1].to_string(),
        )));
    }
    if raw == "true" || raw == "false" {
        return Ok(ArgSpec::Literal(serde_json::Value::Bool(raw == "true")));
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(ArgSpec::Literal(serde_json::Value::from(int)));
    }
    if let Ok(float) = raw.parse::<f64>() {
        return Ok(ArgSpec::Literal(
            serde_json::Number::from_f64(float)
                .map(serde_json::Value::Number)
                .ok_or_else(|| "non-finite float literal".to_string())?,
        ));
    }
    if raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Ok(ArgSpec::FieldRef(raw.to_string()));
    }
    Err(format!("unrecognised argument: {}", raw))
}
