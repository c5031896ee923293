//! 编译产物生成：规范化、派生字段、按类型变换，以及面向旧平台版本的降级

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use uuid::Uuid;

use ruleforge_engine::schema::SourceHints;
use ruleforge_engine::{restricted_fields_for, Canonicalizer, QueryLanguage, RuleType, StackVersion, BUILD_FIELD_VERSIONS};

use super::contents::RuleContents;
use super::context::CompileContext;
use super::integrations::packaged_integrations;
use super::model::{RelatedIntegration, RulePayload};
use super::note;
use super::transform::render_note;
use crate::error::RuleResult;

static CANONICALIZER: Lazy<Canonicalizer> = Lazy::new(Canonicalizer::default);

/// 未声明最低版本时降级的默认目标
const DEFAULT_DOWNGRADE_TARGET: StackVersion = StackVersion::new(8, 3, 0);

impl RuleContents {
    /// 转换为外部平台的 API 形态
    pub fn to_api_format(
        &self,
        ctx: &CompileContext,
        include_version: bool,
        include_metadata: bool,
    ) -> RuleResult<Map<String, Value>> {
        let mut data = serde_json::to_value(self.payload())?;
        render_note(&mut data, self.transform())?;

        let mut converted = match CANONICALIZER.canonicalize(&data) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.post_conversion(ctx, &mut converted)?;

        if include_metadata {
            let metadata = CANONICALIZER.canonicalize(&serde_json::to_value(self.metadata())?);
            converted.insert("meta".to_string(), metadata);
        }
        if include_version {
            if let Some(version) = self.get_synthetic_version(ctx, true)? {
                converted.insert("version".to_string(), Value::from(version));
            }
        }
        Ok(converted)
    }

    fn post_conversion(&self, ctx: &CompileContext, obj: &mut Map<String, Value>) -> RuleResult<()> {
        // threat.technique 始终输出
        if let Some(Value::Array(threats)) = obj.get_mut("threat") {
            for threat in threats.iter_mut().filter_map(Value::as_object_mut) {
                threat
                    .entry("technique")
                    .or_insert_with(|| Value::Array(Vec::new()));
            }
        }

        let effective = self.get_supported_version(ctx)?;
        self.add_related_integrations(ctx, obj, &effective)?;
        self.add_required_fields(ctx, obj, &effective)?;
        self.add_setup(ctx, obj, &effective);

        if self.rule_type() == RuleType::NewTerms {
            unfold_new_terms(obj);
        }
        Ok(())
    }

    /// 派生字段在规则生效版本下是否允许输出
    fn derived_field_allowed(&self, field: &str, effective: &StackVersion) -> bool {
        BUILD_FIELD_VERSIONS.is_field_allowed(field, effective)
            && restricted_fields_for(self.rule_type()).is_field_allowed(field, effective)
    }

    fn add_related_integrations(
        &self,
        ctx: &CompileContext,
        obj: &mut Map<String, Value>,
        effective: &StackVersion,
    ) -> RuleResult<()> {
        const FIELD: &str = "related_integrations";

        let declared = self.metadata().integrations();
        if obj.contains_key(FIELD) || declared.is_empty() || !self.derived_field_allowed(FIELD, effective) {
            return Ok(());
        }
        let Some(manifest) = ctx.manifest() else {
            return Ok(());
        };
        let is_machine_learning = self.rule_type() == RuleType::MachineLearning;
        if !is_machine_learning && self.payload().language() == Some(QueryLanguage::Lucene) {
            return Ok(());
        }

        let datasets = match self.query_ast(ctx)? {
            Some(ast) => ast.datasets_and_modules().0,
            None => Vec::new(),
        };
        let stack = &ctx.config().current_package_version;

        let mut related: Vec<RelatedIntegration> = Vec::new();
        for package in packaged_integrations(manifest, &declared, &datasets, is_machine_learning) {
            let Some(version) = manifest.least_compatible_version(&package.package, stack) else {
                continue;
            };
            let templates = manifest.policy_templates(&package.package, &version).unwrap_or_default();
            let integration = package.integration.filter(|name| templates.contains(name));
            let entry = RelatedIntegration {
                package: package.package,
                version,
                integration,
            };
            if !related.contains(&entry) {
                related.push(entry);
            }
        }

        if !related.is_empty() {
            let value = CANONICALIZER.canonicalize(&serde_json::to_value(&related)?);
            obj.insert(FIELD.to_string(), value);
        }
        Ok(())
    }

    fn add_required_fields(
        &self,
        ctx: &CompileContext,
        obj: &mut Map<String, Value>,
        effective: &StackVersion,
    ) -> RuleResult<()> {
        const FIELD: &str = "required_fields";

        if obj.contains_key(FIELD) || !self.derived_field_allowed(FIELD, effective) {
            return Ok(());
        }
        let Some(resolver) = ctx.field_resolver() else {
            return Ok(());
        };
        // ESQL 查询没有可靠的字段来源
        if matches!(self.payload(), RulePayload::Esql(_)) {
            return Ok(());
        }
        let Some(ast) = self.query_ast(ctx)? else {
            return Ok(());
        };

        let (datasets, modules) = ast.datasets_and_modules();
        let hints = SourceHints {
            indices: self.payload().index().to_vec(),
            datasets,
            modules,
        };
        let fields = self.unique_query_fields(ctx)?;
        let required = resolver.resolve_required_fields(
            fields.iter().map(String::as_str),
            &hints,
            &ctx.config().current_package_version,
        )?;
        if !required.is_empty() {
            obj.insert(FIELD.to_string(), serde_json::to_value(&required)?);
        }
        Ok(())
    }

    fn add_setup(&self, ctx: &CompileContext, obj: &mut Map<String, Value>, effective: &StackVersion) {
        const FIELD: &str = "setup";

        if ctx.config().bypass_note_validation || obj.contains_key(FIELD) || !self.derived_field_allowed(FIELD, effective) {
            return;
        }
        let Some(Value::String(rule_note)) = obj.get("note") else {
            return;
        };
        let Some((remaining, setup)) = note::extract_setup(rule_note) else {
            return;
        };

        if remaining.is_empty() {
            obj.remove("note");
        } else {
            obj.insert("note".to_string(), Value::String(remaining));
        }
        obj.insert(FIELD.to_string(), Value::String(setup));
    }

    /// 降级到旧平台版本：移除目标版本不支持的字段，保留字段的值不变
    /// `replace_id` 为 true 时使用新的随机 rule_id（新身份的版本从 1 开始）
    pub fn downgrade(
        &self,
        ctx: &CompileContext,
        target: Option<&StackVersion>,
        replace_id: bool,
        include_metadata: bool,
    ) -> RuleResult<Map<String, Value>> {
        let target = match target {
            Some(target) => target.clone(),
            None => self.min_stack_version()?.unwrap_or(DEFAULT_DOWNGRADE_TARGET),
        };
        let include_version = !ctx.is_lock_bypassed();
        let mut payload = self.to_api_format(ctx, include_version, include_metadata)?;

        if replace_id {
            payload.insert("rule_id".to_string(), Value::String(Uuid::new_v4().to_string()));
            if include_version {
                payload.insert("version".to_string(), Value::from(1u32));
            }
        }

        let table = restricted_fields_for(self.rule_type()).merged(&BUILD_FIELD_VERSIONS);
        let projected = table.project(&payload, &target);
        log::info!(
            "Downgraded {} to {}: dropped {} field(s)",
            self.payload(),
            target,
            payload.len() - projected.len()
        );
        Ok(projected)
    }
}

/// `new_terms` 展开为 API 形态
fn unfold_new_terms(obj: &mut Map<String, Value>) {
    let Some(Value::Object(mapping)) = obj.remove("new_terms") else {
        return;
    };
    if let (Some(Value::String(field)), Some(value)) = (mapping.get("field"), mapping.get("value")) {
        obj.insert(field.clone(), value.clone());
    }
    if let Some(window) = mapping
        .get("history_window_start")
        .and_then(Value::as_array)
        .and_then(|windows| windows.first())
        .and_then(|first| first.get("value"))
    {
        obj.insert("history_window_start".to_string(), window.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RulesConfig;
    use crate::rule::integrations::StaticManifest;
    use ruleforge_engine::{FieldTypeResolver, SchemaCatalog, StackSchemaMap, VersionLockStore};
    use ruleforge_engine::schema::SchemaReleases;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn document(rule: Value) -> Value {
        json!({
            "metadata": {
                "creation_date": "2024/01/01",
                "updated_date": "2024/02/01",
                "integration": ["aws"],
                "min_stack_version": "8.12"
            },
            "rule": rule
        })
    }

    fn base_rule() -> Value {
        json!({
            "author": ["Elastic"],
            "description": "AWS console login  \n\n",
            "from": "now-9m",
            "index": ["logs-aws.*"],
            "language": "kuery",
            "name": "AWS Console Login",
            "query": "event.dataset:aws.cloudtrail and event.action:ConsoleLogin",
            "risk_score": 21,
            "rule_id": "f2a4b8d0-0000-4000-8000-000000000001",
            "severity": "low",
            "type": "query",
            "note": "## Triage\n\nCheck the user.\n\n## Setup\n\nEnable CloudTrail.\n",
            "investigation_fields": {"field_names": ["user.name"]},
            "threat": [{
                "framework": "MITRE ATT&CK",
                "tactic": {"id": "TA0001", "name": "Initial Access", "reference": "https://attack.mitre.org/tactics/TA0001/"}
            }],
            "actions": [{"id": "a1", "frequency": {"summary": true}}]
        })
    }

    fn ctx() -> CompileContext {
        let fields = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        let catalog = SchemaCatalog::new()
            .with_ecs("8.11.0", fields(&[("event.action", "keyword"), ("event.dataset", "keyword")]))
            .with_integration("aws", "cloudtrail", fields(&[("aws.cloudtrail.user_identity.type", "keyword")]));
        let stack_map = StackSchemaMap::new().with_release(
            StackVersion::new(8, 14, 0),
            SchemaReleases {
                ecs: "8.11.0".into(),
                beats: None,
                endgame: None,
            },
        );
        let manifest = StaticManifest::new().with_package("aws", "2.3.0", "^8.12.0", &["cloudtrail"]);

        CompileContext::new(RulesConfig::default())
            .with_lock_store(Arc::new(VersionLockStore::new()))
            .unwrap()
            .with_field_resolver(FieldTypeResolver::new(Arc::new(catalog), stack_map))
            .with_manifest(Arc::new(manifest))
    }

    #[test]
    fn test_to_api_format_derived_fields() {
        let contents = RuleContents::from_document(&document(base_rule())).unwrap();
        let api = contents.to_api_format(&ctx(), true, false).unwrap();

        assert_eq!(api["description"], "AWS console login");
        assert_eq!(api["threat"][0]["technique"], json!([]));
        assert_eq!(api["actions"][0]["frequency"], json!({"summary": true, "throttle": null}));
        assert_eq!(
            api["related_integrations"],
            json!([{"package": "aws", "version": "^2.3.0", "integration": "cloudtrail"}])
        );
        assert_eq!(
            api["required_fields"],
            json!([
                {"name": "event.action", "type": "keyword", "ecs": true},
                {"name": "event.dataset", "type": "keyword", "ecs": true}
            ])
        );
        assert_eq!(api["setup"], "Enable CloudTrail.");
        assert_eq!(api["note"], "## Triage\n\nCheck the user.");
        assert_eq!(api["version"], 1);
        assert!(!api.contains_key("meta"));
    }

    #[test]
    fn test_derived_fields_gated_by_effective_version() {
        let mut doc = document(base_rule());
        doc["metadata"]["min_stack_version"] = json!("8.3");
        let ctx = ctx();
        let contents = RuleContents::from_document(&doc).unwrap();
        let api = contents.to_api_format(&ctx, false, true).unwrap();
        assert!(api.contains_key("required_fields"));
        assert_eq!(api["meta"]["min_stack_version"], "8.3");
        assert!(!api.contains_key("version"));
    }

    #[test]
    fn test_new_terms_unfold() {
        let mut rule = base_rule();
        rule["type"] = json!("new_terms");
        rule["new_terms_fields"] = json!(["user.name"]);
        rule["history_window_start"] = json!("now-14d");
        let contents = RuleContents::from_document(&document(rule)).unwrap();
        let api = contents.to_api_format(&ctx(), false, false).unwrap();
        assert_eq!(api["new_terms_fields"], json!(["user.name"]));
        assert_eq!(api["history_window_start"], "now-14d");
        assert!(!api.contains_key("new_terms"));
    }

    #[test]
    fn test_hash_ignores_version_and_integrations() {
        let ctx = ctx();
        let contents = RuleContents::from_document(&document(base_rule())).unwrap();
        let plain = contents.hash(&ctx, false, false).unwrap();
        assert_ne!(plain, contents.hash(&ctx, false, true).unwrap());
        assert_ne!(plain, contents.hash(&ctx, true, false).unwrap());
        assert_eq!(plain, contents.hash(&ctx, false, false).unwrap());
    }

    #[test]
    fn test_downgrade_projects_fields() {
        let ctx = ctx();
        let contents = RuleContents::from_document(&document(base_rule())).unwrap();
        let compiled = contents.to_api_format(&ctx, true, false).unwrap();
        let target = StackVersion::new(8, 2, 0);
        let downgraded = contents.downgrade(&ctx, Some(&target), false, false).unwrap();

        for dropped in ["investigation_fields", "related_integrations", "required_fields", "setup"] {
            assert!(!downgraded.contains_key(dropped), "{dropped} should be dropped");
        }
        for (key, value) in &downgraded {
            assert_eq!(compiled.get(key), Some(value));
        }

        let forked = contents.downgrade(&ctx, Some(&target), true, false).unwrap();
        assert_ne!(forked["rule_id"], compiled["rule_id"]);
        assert_eq!(forked["version"], 1);
    }
}
