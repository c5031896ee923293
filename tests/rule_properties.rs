use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use ruleforge::{
    compile_rule, validate_rule, CompileContext, LockRoute, RuleContents, RuleError, RulesConfig, StackVersion,
    VersionLockStore,
};
use ruleforge_engine::schema::{SchemaReleases, SourceHints};
use ruleforge_engine::{
    restricted_fields_for, FieldTypeResolver, RestrictedFieldTable, RuleType, SchemaCatalog, StackSchemaMap,
    VersionRange,
};

fn v(raw: &str) -> StackVersion {
    StackVersion::parse(raw).unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn query_rule(min_stack: &str, patch: Value) -> RuleContents {
    init_logging();
    let mut rule = json!({
        "author": ["Elastic"],
        "description": "Detects a suspicious process.",
        "from": "now-9m",
        "index": ["logs-endpoint.events.*"],
        "language": "kuery",
        "name": "Suspicious Process",
        "query": "event.category:process and process.name:evil.exe",
        "risk_score": 47,
        "rule_id": "0b2f3c4d-1111-4222-8333-944455556666",
        "severity": "medium",
        "tags": ["Domain: Endpoint", "OS: Windows"],
        "type": "query"
    });
    for (key, value) in patch.as_object().unwrap() {
        rule[key] = value.clone();
    }
    RuleContents::from_document(&json!({
        "metadata": {
            "creation_date": "2024/01/01",
            "updated_date": "2024/01/01",
            "min_stack_version": min_stack
        },
        "rule": rule
    }))
    .unwrap()
}

fn locked_ctx(config: RulesConfig) -> (CompileContext, Arc<VersionLockStore>) {
    let store = Arc::new(VersionLockStore::new());
    let ctx = CompileContext::new(config).with_lock_store(store.clone()).unwrap();
    (ctx, store)
}

#[test]
fn hash_is_stable_under_reordering_and_whitespace() {
    let (ctx, _) = locked_ctx(RulesConfig::default());
    let base = query_rule("8.9", json!({"note": "## Triage\n\nCheck it."}));

    let reordered_source = r###"{
        "rule": {
            "type": "query", "tags": ["Domain: Endpoint", "OS: Windows"], "severity": "medium",
            "rule_id": "0b2f3c4d-1111-4222-8333-944455556666", "risk_score": 47,
            "query": "event.category:process and process.name:evil.exe", "name": "Suspicious Process",
            "language": "kuery", "index": ["logs-endpoint.events.*"], "from": "now-9m",
            "description": "Detects a suspicious process.   \n\n", "author": ["Elastic"],
            "note": "## Triage   \n\nCheck it.  \n"
        },
        "metadata": {"min_stack_version": "8.9", "updated_date": "2024/01/01", "creation_date": "2024/01/01"}
    }"###;
    let reordered = RuleContents::from_json(reordered_source).unwrap();

    assert_eq!(
        base.hash(&ctx, false, false).unwrap(),
        reordered.hash(&ctx, false, false).unwrap()
    );

    for patch in [json!({"risk_score": 48}), json!({"name": "Renamed Process"}), json!({"severity": "high"})] {
        let changed = query_rule("8.9", patch);
        assert_ne!(base.hash(&ctx, false, false).unwrap(), changed.hash(&ctx, false, false).unwrap());
    }
}

#[test]
fn dirty_compiles_bump_version_by_one() {
    let (ctx, store) = locked_ctx(RulesConfig::default());

    let first = compile_rule(&query_rule("8.9", json!({})), &ctx).unwrap();
    assert_eq!(first.version, Some(1));

    for (round, expected) in (2..=4u32).enumerate() {
        let edited = query_rule("8.9", json!({"description": format!("Edited description {round}")}));
        assert!(edited.is_dirty(&ctx).unwrap());
        let compiled = compile_rule(&edited, &ctx).unwrap();
        assert_eq!(compiled.version, Some(expected));
        assert_eq!(compiled.lock.map(|l| l.route), Some(LockRoute::Bumped));
    }
    assert_eq!(store.get("0b2f3c4d-1111-4222-8333-944455556666").unwrap().version, 4);
}

#[test]
fn unchanged_compile_is_idempotent() {
    let (ctx, _) = locked_ctx(RulesConfig::default());
    let rule = query_rule("8.9", json!({}));

    let first = compile_rule(&rule, &ctx).unwrap();
    let second = compile_rule(&rule, &ctx).unwrap();
    let third = compile_rule(&rule, &ctx).unwrap();

    assert_eq!(first.sha256, second.sha256);
    assert_eq!(second.sha256, third.sha256);
    assert_eq!(first.version, second.version);
    assert_eq!(second.version, third.version);
    assert_eq!(third.lock.map(|l| l.route), Some(LockRoute::Unchanged));
    assert_eq!(first.payload, third.payload);
}

#[test]
fn downgrade_keeps_a_value_preserving_subset() {
    let (ctx, _) = locked_ctx(RulesConfig::default());
    let rule = query_rule(
        "8.12",
        json!({
            "investigation_fields": {"field_names": ["process.name", "host.name"]},
            "alert_suppression": {"group_by": ["host.name"], "missing_fields_strategy": "suppress"},
            "note": "## Triage\n\nCheck it.\n\n## Setup\n\nInstall the agent."
        }),
    );
    let compiled = compile_rule(&rule, &ctx).unwrap().payload;
    assert_eq!(compiled["setup"], "Install the agent.");

    for target in ["8.3", "8.7", "8.8", "8.10", "8.11"] {
        let downgraded = rule.downgrade(&ctx, Some(&v(target)), false, false).unwrap();
        for (field, value) in &downgraded {
            assert_eq!(compiled.get(field), Some(value), "{field} changed when targeting {target}");
        }
        let expect_suppression = v(target) >= v("8.8");
        assert_eq!(downgraded.contains_key("alert_suppression"), expect_suppression, "target {target}");
        assert_eq!(downgraded.contains_key("investigation_fields"), v(target) >= v("8.11"));
    }
}

#[test]
fn gating_boundaries() {
    let table = restricted_fields_for(RuleType::Eql);
    assert!(!table.is_field_allowed("alert_suppression", &v("8.13.9")));
    assert!(table.is_field_allowed("alert_suppression", &v("8.14")));
    assert!(table.is_field_allowed("not_listed", &v("7.0")));

    let bounded = RestrictedFieldTable::new().with(
        "legacy_field",
        VersionRange::new(v("8.3"), Some(v("8.8"))).unwrap(),
    );
    assert!(!bounded.is_field_allowed("legacy_field", &v("8.2")));
    assert!(bounded.is_field_allowed("legacy_field", &v("8.3")));
    assert!(bounded.is_field_allowed("legacy_field", &v("8.8")));
    assert!(!bounded.is_field_allowed("legacy_field", &v("8.9")));
}

#[test]
fn building_block_timing_floors() {
    let ctx = CompileContext::new(RulesConfig::default());
    let short = query_rule(
        "8.9",
        json!({"building_block_type": "default", "from": "now-60m", "interval": "30m"}),
    );
    let report = validate_rule(&short, &ctx).unwrap_err();
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], RuleError::TimingValidation { .. }));

    let long = query_rule(
        "8.9",
        json!({"building_block_type": "default", "from": "now-119m", "interval": "60m"}),
    );
    assert!(validate_rule(&long, &ctx).is_ok());
}

#[test]
fn esql_requires_keep_clause() {
    let ctx = CompileContext::new(RulesConfig::default());
    let esql = |query: &str| {
        RuleContents::from_document(&json!({
            "metadata": {"creation_date": "2024/01/01", "updated_date": "2024/01/01", "min_stack_version": "8.13"},
            "rule": {
                "author": ["Elastic"],
                "description": "Host activity spike.",
                "language": "esql",
                "name": "Host Activity Spike",
                "query": query,
                "risk_score": 21,
                "rule_id": "7d0e4b1c-2f3a-4b5c-9d6e-8f7a6b5c4d3e",
                "severity": "low",
                "type": "esql"
            }
        }))
        .unwrap()
    };

    let report = validate_rule(&esql("FROM logs-* | STATS count() BY host.name"), &ctx).unwrap_err();
    assert!(matches!(report.errors[0], RuleError::StructuralValidation { .. }));
    assert!(report.errors[0].to_string().contains("keep"));

    assert!(validate_rule(&esql("FROM logs-* | STATS count() BY host.name | KEEP host.name"), &ctx).is_ok());
}

#[test]
fn field_types_follow_source_precedence() {
    let fields = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
        pairs.iter().map(|(k, t)| (k.to_string(), t.to_string())).collect()
    };
    let catalog = SchemaCatalog::new()
        .with_ecs("8.11.0", fields(&[("event.category", "keyword")]))
        .with_integration(
            "aws",
            "cloudtrail",
            fields(&[("aws.cloudtrail.event_type", "keyword"), ("event.category", "text")]),
        );
    let stack_map = StackSchemaMap::new().with_release(
        v("8.14"),
        SchemaReleases {
            ecs: "8.11.0".into(),
            beats: None,
            endgame: None,
        },
    );
    let resolver = FieldTypeResolver::new(Arc::new(catalog), stack_map);
    let hints = SourceHints {
        indices: vec!["logs-aws.*".into()],
        datasets: vec!["aws.cloudtrail".into()],
        modules: Vec::new(),
    };

    let resolved = resolver
        .resolve_required_fields(
            ["made.up.field", "event.category", "aws.cloudtrail.event_type"],
            &hints,
            &v("8.14"),
        )
        .unwrap();

    let summary: Vec<(&str, &str, bool)> = resolved
        .iter()
        .map(|f| (f.name.as_str(), f.field_type.as_str(), f.ecs))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("aws.cloudtrail.event_type", "keyword", false),
            ("event.category", "keyword", true),
            ("made.up.field", "unknown", false),
        ]
    );
}

#[test]
fn raising_min_stack_forks_the_lock() {
    let config = RulesConfig::builder()
        .current_package_version(v("8.11"))
        .build()
        .unwrap();
    let (ctx, store) = locked_ctx(config);
    let rule_id = "0b2f3c4d-1111-4222-8333-944455556666";

    compile_rule(&query_rule("8.9", json!({})), &ctx).unwrap();
    compile_rule(&query_rule("8.9", json!({"description": "v2"})), &ctx).unwrap();

    let raised = query_rule("8.12", json!({"description": "v2", "tags": ["Domain: Endpoint"]}));
    let forked = compile_rule(&raised, &ctx).unwrap();
    assert_eq!(forked.lock.map(|l| l.route), Some(LockRoute::Forked));
    assert_eq!(forked.version, Some(102));

    let entry = store.get(rule_id).unwrap();
    assert_eq!(entry.min_stack_version, "8.12");
    let previous = &entry.previous.as_ref().unwrap()["8.9"];
    assert_eq!((previous.version, previous.max_allowable_version), (2, 101));

    // 旧分支继续维护
    let old_branch = query_rule("8.9", json!({"description": "v3"}));
    assert!(old_branch.has_forked(&ctx));
    assert!(old_branch.is_in_forked_version(&ctx));
    assert_eq!(old_branch.version_space(&ctx).unwrap(), Some(98));

    let patched = compile_rule(&old_branch, &ctx).unwrap();
    assert_eq!(patched.version, Some(3));
    assert_eq!(old_branch.version_space(&ctx).unwrap(), Some(97));
    assert_eq!(store.get(rule_id).unwrap().version, 102);
}

#[test]
fn bypass_mode_never_touches_the_lock() {
    let config = RulesConfig::builder().bypass_version_lock(true).build().unwrap();
    let ctx = CompileContext::new(config);
    let rule = query_rule("8.9", json!({"version": 5}));

    let compiled = compile_rule(&rule, &ctx).unwrap();
    assert_eq!(compiled.lock, None);
    assert_eq!(compiled.payload.get("version"), Some(&json!(5)));
    assert_eq!(compiled.version, Some(5));

    let with_version = rule.to_api_format(&ctx, true, false).unwrap();
    assert_eq!(with_version.get("version"), Some(&json!(5)));

    let unversioned = query_rule("8.9", json!({}));
    let defaulted = unversioned.to_api_format(&ctx, true, false).unwrap();
    assert_eq!(defaulted.get("version"), Some(&json!(1)));
    assert!(matches!(rule.record_lock(&ctx), Err(RuleError::Configuration(_))));
}
