mod helpers;

use siem_rule_engine::parser::validate;
use siem_rule_engine::ruleset::{Ruleset, ThresholdBackend};

use helpers::build_context;

#[test]
fn missing_rule_id_reports_the_rule_line() {
    // The last <rule> carries no id; its line is computed from the fixture.
    let source = r#"<root type="DETECTION" name="lines" author="qa">
  <rule id="R1">
    <check type="INCL" field="cmd">curl</check>
  </rule>
  <rule id="R2">
    <checklist>
      <check type="EQU" field="user">root</check>
    </checklist>
  </rule>
  <rule id="R3">
    <check type="NOTNULL" field="host"/>
  </rule>
  <rule>
    <check type="INCL" field="cmd">wget</check>
  </rule>
</root>"#;
    // Count to be sure the fixture stays honest.
    let rule_line = source
        .lines()
        .position(|l| l.trim() == "<rule>")
        .map(|i| i + 1)
        .unwrap();

    let result = validate(source, &build_context());
    assert!(!result.ok);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].line, rule_line);
    assert!(result.errors[0].message.contains("rule id"));
}

#[test]
fn defect_lines_fall_within_their_elements() {
    let cases = [
        (
            r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <check type="GLOB" field="cmd">x</check>
  </rule>
</root>"#,
            3,
            "unknown check type",
        ),
        (
            r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <check type="REGEX" field="cmd">[unclosed</check>
  </rule>
</root>"#,
            3,
            "does not compile",
        ),
        (
            r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <check type="INCL" field="cmd">x</check>
    <threshold group_by="src" range="eleven">5</threshold>
  </rule>
</root>"#,
            4,
            "range does not parse",
        ),
        (
            r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <check type="INCL" field="cmd">x</check>
    <filter field="cmd">x</filter>
  </rule>
</root>"#,
            4,
            "not supported",
        ),
    ];

    for (source, line, needle) in cases {
        let result = validate(source, &build_context());
        assert!(!result.ok, "expected errors for: {}", needle);
        let found = result
            .errors
            .iter()
            .find(|d| d.message.contains(needle))
            .unwrap_or_else(|| panic!("no diagnostic containing {:?}", needle));
        let delta = found.line.abs_diff(line);
        assert!(delta <= 1, "line {} too far from {}", found.line, line);
    }
}

#[test]
fn duplicate_rule_and_node_ids_are_rejected() {
    let dup_rules = r#"<root type="DETECTION" name="t">
  <rule id="R1"><check type="NOTNULL" field="a"/></rule>
  <rule id="R1"><check type="NOTNULL" field="b"/></rule>
</root>"#;
    let result = validate(dup_rules, &build_context());
    assert!(result.errors.iter().any(|d| d.message.contains("duplicate rule id")));

    let dup_nodes = r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <checklist condition="a and a">
      <check id="a" type="NOTNULL" field="x"/>
      <check id="a" type="NOTNULL" field="y"/>
    </checklist>
  </rule>
</root>"#;
    let result = validate(dup_nodes, &build_context());
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("duplicate check id")));
}

#[test]
fn condition_requires_ids_and_clean_syntax() {
    let missing_ids = r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <checklist condition="a and b">
      <check id="a" type="NOTNULL" field="x"/>
      <check type="NOTNULL" field="y"/>
    </checklist>
  </rule>
</root>"#;
    let result = validate(missing_ids, &build_context());
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("carry an id")));

    let symbols = r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <checklist condition="a &amp;&amp; b">
      <check id="a" type="NOTNULL" field="x"/>
      <check id="b" type="NOTNULL" field="y"/>
    </checklist>
  </rule>
</root>"#;
    let result = validate(symbols, &build_context());
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("condition does not parse")));
}

#[test]
fn rules_need_a_check_like_operation() {
    let source = r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <append field="tag">x</append>
  </rule>
</root>"#;
    let result = validate(source, &build_context());
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("at least one check")));
}

#[test]
fn unsupported_elements_name_the_enclosing_rule() {
    let source = r#"<root type="DETECTION" name="t">
  <rule id="R7">
    <check type="NOTNULL" field="a"/>
    <enrich field="geo"/>
  </rule>
</root>"#;
    let result = validate(source, &build_context());
    let diag = result
        .errors
        .iter()
        .find(|d| d.message.contains("unsupported element"))
        .expect("unsupported element diagnostic");
    assert!(diag.message.contains("enrich"));
    assert!(diag.message.contains("R7"));
}

#[test]
fn per_rule_limits_on_checklist_and_del() {
    let source = r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <checklist><check type="NOTNULL" field="a"/></checklist>
    <checklist><check type="NOTNULL" field="b"/></checklist>
    <del>x</del>
    <del>y</del>
  </rule>
</root>"#;
    let result = validate(source, &build_context());
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("more than one checklist")));
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("more than one del")));
}

#[test]
fn plugin_references_are_resolved_at_build() {
    let missing = r#"<root type="DETECTION" name="t">
  <rule id="R1"><check type="PLUGIN">no_such_plugin(_$ip)</check></rule>
</root>"#;
    let result = validate(missing, &build_context());
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("not registered")));

    let draft = r#"<root type="DETECTION" name="t">
  <rule id="R1"><check type="PLUGIN">unsaved_enrich(_$ip)</check></rule>
</root>"#;
    let result = validate(draft, &build_context());
    assert!(result.errors.iter().any(|d| d.message.contains("draft")));

    let wrong_type = r#"<root type="DETECTION" name="t">
  <rule id="R1"><check type="PLUGIN">const_value("x")</check></rule>
</root>"#;
    let result = validate(wrong_type, &build_context());
    assert!(result
        .errors
        .iter()
        .any(|d| d.message.contains("does not return bool")));
}

#[test]
fn malformed_xml_aborts_with_a_single_diagnostic() {
    let source = "<root type=\"DETECTION\">\n  <rule id=\"R1\">\n";
    let result = validate(source, &build_context());
    assert!(!result.ok);
    assert!(!result.errors.is_empty());
}

#[test]
fn dry_run_validation_accepts_a_full_featured_ruleset() {
    let source = r#"<root type="DETECTION" name="full" author="qa">
  <rule id="R1" name="mixed">
    <checklist condition="a and (b or not c)">
      <check id="a" type="INCL" field="cmd">curl</check>
      <check id="b" type="REGEX" field="cmd">https?://\S+</check>
      <check id="c" type="PLUGIN">is_private_ip(_$dest_ip)</check>
    </checklist>
    <check type="NCS_INCL" field="agent" logic="OR" delimiter="|">bot|crawler</check>
    <threshold group_by="src,dest" range="5m" count_type="CLASSIFY"
               count_field="dest_port" local_cache="true">10</threshold>
    <append type="PLUGIN" field="note">const_value("seen")</append>
    <plugin>is_private_ip(_$src_ip)</plugin>
    <del>tmp.scratch,raw_payload</del>
  </rule>
</root>"#;
    let result = validate(source, &build_context());
    assert!(result.ok, "errors: {:?}", result.errors);
    assert!(result.errors.is_empty());
}

#[test]
fn remote_threshold_without_kv_warns_and_builds() {
    let source = r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <check type="NOTNULL" field="src"/>
    <threshold group_by="src" range="10s">5</threshold>
  </rule>
</root>"#;
    let result = validate(source, &build_context());
    assert!(result.ok);
    assert!(result
        .warnings
        .iter()
        .any(|d| d.message.contains("no KV store")));

    let ruleset = Ruleset::build("rs", source, &build_context()).unwrap();
    assert_eq!(
        ruleset.def.rules[0].thresholds[0].backend,
        ThresholdBackend::Remote
    );
}

#[test]
fn checklist_nodes_are_reordered_cheapest_first() {
    let source = r#"<root type="DETECTION" name="t">
  <rule id="R1">
    <checklist>
      <check type="PLUGIN">is_private_ip(_$ip)</check>
      <check type="REGEX" field="cmd">x+</check>
      <check type="INCL" field="cmd">x</check>
      <check type="ISNULL" field="gone"/>
    </checklist>
  </rule>
</root>"#;
    let ruleset = Ruleset::build("rs", source, &build_context()).unwrap();
    let tiers: Vec<u8> = ruleset.def.rules[0].checklists[0]
        .nodes
        .iter()
        .map(|n| n.match_type.cost_tier())
        .collect();
    assert_eq!(tiers, vec![0, 1, 2, 3]);
}

#[test]
fn build_surfaces_diagnostics_as_an_error() {
    let source = r#"<root type="DETECTION" name="t">
  <rule>
    <check type="INCL" field="cmd">x</check>
  </rule>
</root>"#;
    let err = Ruleset::build("rs", source, &build_context()).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("line 2"), "got: {}", text);
    assert!(text.contains("rule id"), "got: {}", text);
}
