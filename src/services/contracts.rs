//! Contract validator for policy, state manifest, extension descriptor,
//! contract policy and package manifest documents.
//!
//! Every check appends to a [`ValidationReport`] and keeps going; malformed
//! input is reported, never raised. Schema and invariant findings are
//! advisory unless `strict` is set. Traversal and integrity findings are
//! always errors.

use crate::domain::constants::{
    CLEAN_FOUNDATION_FIELDS, COMMAND_CONTRACT_VERSION, FILTERED_HISTORY_FIELDS, METRIC_KEYS,
    PACKAGE_FORMAT_VERSION, WEIGHT_NORMALIZATION_TOLERANCE,
};
use crate::domain::errors::DeltaError;
use crate::domain::models::{
    CommandContract, Entrypoint, ExtensionDescriptor, PackageEntry, SchemaKind, ValidationReport,
    ViolationKind,
};
use crate::services::{digest, paths, storage};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions<'a> {
    pub strict: bool,
    /// When set, manifest required files must exist under this root.
    pub source_root: Option<&'a Path>,
}

pub fn validate(document: &Value, kind: SchemaKind, opts: &ValidateOptions) -> ValidationReport {
    validate_at(document, kind, kind.label(), opts)
}

/// Same as [`validate`], with finding paths rooted at `context`.
pub fn validate_at(
    document: &Value,
    kind: SchemaKind,
    context: &str,
    opts: &ValidateOptions,
) -> ValidationReport {
    let mut report = ValidationReport::new();
    {
        let mut c = Checker {
            report: &mut report,
            strict: opts.strict,
        };
        match kind {
            SchemaKind::Policy => check_policy(&mut c, document, context),
            SchemaKind::Manifest => check_manifest(&mut c, document, context, opts.source_root),
            SchemaKind::Extension => check_extension(&mut c, document, context),
            SchemaKind::Package => check_package(&mut c, document, context),
            SchemaKind::ContractPolicy => check_contract_policy(&mut c, document, context),
        }
    }
    report
}

/// Loads a JSON document for checking. Unreadable or unparseable input
/// becomes an error finding under `context` instead of an `Err`.
pub fn load_for_validation(
    path: &Path,
    context: &str,
    report: &mut ValidationReport,
) -> Option<Value> {
    match storage::load_document(path) {
        Ok(doc) => Some(doc),
        Err(e @ DeltaError::Read { .. }) => {
            report.error(
                ViolationKind::SchemaViolation,
                "document.unreadable",
                context,
                e.to_string(),
            );
            None
        }
        Err(e) => {
            report.error(
                ViolationKind::SchemaViolation,
                "document.malformed",
                context,
                format!("{}: {e}", path.display()),
            );
            None
        }
    }
}

/// Every capability the policy asks for must be provided by some descriptor.
pub fn check_capability_references(
    policy: &Value,
    descriptors: &[ExtensionDescriptor],
    strict: bool,
) -> ValidationReport {
    let mut report = ValidationReport::new();
    let provided: HashSet<&str> = descriptors
        .iter()
        .flat_map(|d| d.capabilities.iter().map(String::as_str))
        .collect();

    if let Some(items) = policy.get("required_capabilities").and_then(|v| v.as_array()) {
        for (i, item) in items.iter().enumerate() {
            let Some(cap) = item.as_str() else {
                continue;
            };
            if !provided.contains(cap.trim()) {
                report.record(
                    ViolationKind::InvariantViolation,
                    strict,
                    "policy.capability_unresolved",
                    format!("policy.required_capabilities[{i}]"),
                    format!("capability `{}` is not provided by any extension", cap.trim()),
                );
            }
        }
    }
    report
}

/// Lenient entrypoint extraction; accepts `{key: path}` or `[path, ...]`.
pub fn entrypoints_of(document: &Value) -> Vec<Entrypoint> {
    match document.get("entrypoints") {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                v.as_str().map(|p| Entrypoint {
                    key: k.clone(),
                    path: p.trim().to_string(),
                })
            })
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|p| Entrypoint {
                key: p.trim().to_string(),
                path: p.trim().to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Commands in declaration order; only the `{key: path}` form exists.
pub fn commands_of(document: &Value) -> Vec<Entrypoint> {
    document
        .get("commands")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    v.as_str().map(|p| Entrypoint {
                        key: k.trim().to_string(),
                        path: p.trim().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn command_contract_of(document: &Value) -> Option<CommandContract> {
    let contract = document.get("command_contract")?;
    Some(CommandContract {
        version: contract.get("version")?.as_i64()?,
        namespace: contract.get("namespace")?.as_str()?.trim().to_string(),
    })
}

/// `current_version` of the extension command contract, when the policy
/// states one.
pub fn command_contract_target(contract_policy: &Value) -> Option<i64> {
    contract_policy
        .pointer("/targets/extension_command_contract/current_version")
        .and_then(Value::as_i64)
}

/// Lowercase, runs of anything but ASCII letters and digits folded into one
/// `-`, no leading or trailing `-`.
pub fn normalize_slug(text: &str) -> String {
    let mut out = String::new();
    let mut prev_dash = false;
    for c in text.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Every extension declaring commands must be on the contract version the
/// contract policy targets.
pub fn check_command_contracts(
    contract_policy: &Value,
    descriptors: &[ExtensionDescriptor],
    strict: bool,
) -> ValidationReport {
    let mut report = ValidationReport::new();
    let Some(target) = command_contract_target(contract_policy) else {
        return report;
    };
    for d in descriptors.iter().filter(|d| !d.commands.is_empty()) {
        let path = format!("extensions/{}.command_contract", d.dir_name);
        match &d.command_contract {
            Some(contract) if contract.version == target => {}
            Some(contract) => report.record(
                ViolationKind::InvariantViolation,
                strict,
                "extension.contract_version_stale",
                path,
                format!(
                    "command contract version {} differs from policy target {target}; run contracts-migrate",
                    contract.version
                ),
            ),
            // Already reported by the descriptor shape check.
            None => {}
        }
    }
    report
}

struct Checker<'r> {
    report: &'r mut ValidationReport,
    strict: bool,
}

impl Checker<'_> {
    fn schema(&mut self, rule: &str, path: &str, message: impl Into<String>) {
        self.report.record(
            ViolationKind::SchemaViolation,
            self.strict,
            rule,
            path,
            message,
        );
    }

    fn invariant(&mut self, rule: &str, path: &str, message: impl Into<String>) {
        self.report.record(
            ViolationKind::InvariantViolation,
            self.strict,
            rule,
            path,
            message,
        );
    }

    fn traversal(&mut self, rule: &str, path: &str, message: impl Into<String>) {
        self.report
            .error(ViolationKind::TraversalViolation, rule, path, message);
    }

    fn required(&mut self, path: &str) {
        self.schema("schema.required", path, format!("`{path}` is required"));
    }

    fn root<'v>(&mut self, doc: &'v Value, ctx: &str) -> Option<&'v Map<String, Value>> {
        match doc {
            Value::Object(map) => Some(map),
            _ => {
                // Nothing else can be checked, so this one is always fatal.
                self.report.error(
                    ViolationKind::SchemaViolation,
                    "document.malformed",
                    ctx,
                    format!("`{ctx}` must be a JSON object"),
                );
                None
            }
        }
    }

    fn object<'v>(&mut self, value: Option<&'v Value>, path: &str) -> Option<&'v Map<String, Value>> {
        match value {
            None | Some(Value::Null) => {
                self.required(path);
                None
            }
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                self.schema("schema.type", path, format!("`{path}` must be an object"));
                None
            }
        }
    }

    /// Optional section: absent is fine unless strict.
    fn section<'v>(
        &mut self,
        parent: &'v Map<String, Value>,
        key: &str,
        path: &str,
    ) -> Option<&'v Map<String, Value>> {
        match parent.get(key) {
            None => {
                if self.strict {
                    self.schema(
                        "schema.required",
                        path,
                        format!("`{path}` is required in strict mode"),
                    );
                }
                None
            }
            Some(v) => self.object(Some(v), path),
        }
    }

    fn string<'v>(&mut self, value: Option<&'v Value>, path: &str) -> Option<&'v str> {
        match value {
            None | Some(Value::Null) => {
                self.required(path);
                None
            }
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => {
                self.schema("schema.type", path, format!("`{path}` must be a string"));
                None
            }
        }
    }

    fn non_empty_str<'v>(&mut self, value: Option<&'v Value>, path: &str) -> Option<&'v str> {
        let s = self.string(value, path)?;
        if s.trim().is_empty() {
            self.schema(
                "schema.empty",
                path,
                format!("`{path}` must be a non-empty string"),
            );
            return None;
        }
        Some(s.trim())
    }

    fn boolean(&mut self, value: Option<&Value>, path: &str) -> Option<bool> {
        match value {
            None | Some(Value::Null) => {
                self.required(path);
                None
            }
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => {
                self.schema("schema.type", path, format!("`{path}` must be a boolean"));
                None
            }
        }
    }

    fn integer(&mut self, value: Option<&Value>, path: &str, min: i64) -> Option<i64> {
        let n = match value {
            None | Some(Value::Null) => {
                self.required(path);
                return None;
            }
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.as_i64().unwrap_or(i64::MAX),
            Some(_) => {
                self.schema("schema.type", path, format!("`{path}` must be an integer"));
                return None;
            }
        };
        if n < min {
            self.schema("schema.range", path, format!("`{path}` must be >= {min}"));
            return None;
        }
        Some(n)
    }

    fn number(&mut self, value: Option<&Value>, path: &str, min: f64, max: Option<f64>) -> Option<f64> {
        let n = match value {
            None | Some(Value::Null) => {
                self.required(path);
                return None;
            }
            Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
            Some(_) => {
                self.schema("schema.type", path, format!("`{path}` must be a number"));
                return None;
            }
        };
        let in_range = n >= min && max.map(|m| n <= m).unwrap_or(true);
        if !in_range {
            let bound = match max {
                Some(m) => format!("within [{min}, {m}]"),
                None => format!(">= {min}"),
            };
            self.schema("schema.range", path, format!("`{path}` must be {bound}, got {n}"));
            return None;
        }
        Some(n)
    }

    fn string_list(
        &mut self,
        value: Option<&Value>,
        path: &str,
        allow_empty: bool,
        unique: bool,
    ) -> Vec<String> {
        let items = match value {
            None | Some(Value::Null) => {
                self.required(path);
                return Vec::new();
            }
            Some(Value::Array(items)) => items,
            Some(_) => {
                self.schema(
                    "schema.type",
                    path,
                    format!("`{path}` must be a list of strings"),
                );
                return Vec::new();
            }
        };

        let mut parsed = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if let Some(s) = self.non_empty_str(Some(item), &format!("{path}[{i}]")) {
                parsed.push(s.to_string());
            }
        }
        if !allow_empty && items.is_empty() {
            self.schema("schema.empty", path, format!("`{path}` must not be empty"));
        }
        if unique {
            let mut seen = HashSet::new();
            let dups: BTreeSet<&str> = parsed
                .iter()
                .filter(|s| !seen.insert(s.as_str()))
                .map(String::as_str)
                .collect();
            if !dups.is_empty() {
                let listed = dups.into_iter().collect::<Vec<_>>().join(", ");
                self.schema(
                    "schema.duplicate",
                    path,
                    format!("`{path}` must not contain duplicates: {listed}"),
                );
            }
        }
        parsed
    }
}

fn check_policy(c: &mut Checker, doc: &Value, ctx: &str) {
    let Some(policy) = c.root(doc, ctx) else {
        return;
    };

    c.integer(policy.get("version"), &format!("{ctx}.version"), 1);

    for block in ["origin", "upstream"] {
        let path = format!("{ctx}.{block}");
        let Some(obj) = c.section(policy, block, &path) else {
            continue;
        };
        c.non_empty_str(obj.get("remote"), &format!("{path}.remote"));
        c.non_empty_str(obj.get("branch"), &format!("{path}.branch"));
        if block == "upstream" {
            match obj.get("url") {
                Some(url) => {
                    c.string(Some(url), &format!("{path}.url"));
                }
                None if c.strict => c.schema(
                    "schema.required",
                    &format!("{path}.url"),
                    format!("`{path}.url` is required in strict mode"),
                ),
                None => {}
            }
        }
    }

    let path = format!("{ctx}.sync_button_policy");
    if let Some(sync) = c.section(policy, "sync_button_policy", &path) {
        c.boolean(
            sync.get("require_clean_worktree"),
            &format!("{path}.require_clean_worktree"),
        );
        c.integer(
            sync.get("max_origin_only_commits"),
            &format!("{path}.max_origin_only_commits"),
            0,
        );
        c.boolean(
            sync.get("require_upstream_only_commits"),
            &format!("{path}.require_upstream_only_commits"),
        );
    }

    let path = format!("{ctx}.scorecard");
    if let Some(scorecard) = c.section(policy, "scorecard", &path) {
        check_scorecard(c, scorecard, &path);
    }

    let path = format!("{ctx}.schedule");
    if let Some(schedule) = c.section(policy, "schedule", &path) {
        for key in ["timezone", "weekly_day", "cron_utc"] {
            c.non_empty_str(schedule.get(key), &format!("{path}.{key}"));
        }
    }

    if let Some(metrics) = policy.get("history_metrics") {
        let path = format!("{ctx}.history_metrics");
        if let Some(metrics) = c.object(Some(metrics), &path) {
            check_history_metrics(c, metrics, &path);
        }
    }

    if let Some(caps) = policy.get("required_capabilities") {
        c.string_list(
            Some(caps),
            &format!("{ctx}.required_capabilities"),
            true,
            true,
        );
    }
}

fn check_scorecard(c: &mut Checker, scorecard: &Map<String, Value>, path: &str) {
    c.number(
        scorecard.get("clean_foundation_threshold"),
        &format!("{path}.clean_foundation_threshold"),
        0.0,
        Some(1.0),
    );

    let weights_path = format!("{path}.weights");
    let Some(weights) = c.object(scorecard.get("weights"), &weights_path) else {
        return;
    };

    let mut total = 0.0;
    let mut complete = true;
    for metric in METRIC_KEYS {
        match c.number(weights.get(metric), &format!("{weights_path}.{metric}"), 0.0, None) {
            Some(w) => total += w,
            None => complete = false,
        }
    }
    let unknown: Vec<&str> = weights
        .keys()
        .map(String::as_str)
        .filter(|k| !METRIC_KEYS.contains(k))
        .collect();
    if !unknown.is_empty() {
        c.schema(
            "schema.unsupported",
            &weights_path,
            format!("`{weights_path}` has unsupported metrics: {}", unknown.join(", ")),
        );
    }
    if !complete {
        return;
    }
    if total <= 0.0 {
        c.invariant(
            "policy.weights_zero_sum",
            &weights_path,
            format!("`{weights_path}` must sum to > 0"),
        );
    }

    let normalized_path = format!("{path}.weights_normalized");
    if let Some(flag) = scorecard.get("weights_normalized") {
        if c.boolean(Some(flag), &normalized_path) == Some(true)
            && (total - 1.0).abs() > WEIGHT_NORMALIZATION_TOLERANCE
        {
            c.invariant(
                "policy.weights_not_normalized",
                &weights_path,
                format!("`{weights_path}` is declared normalized but sums to {total}"),
            );
        }
    }
}

fn check_history_metrics(c: &mut Checker, metrics: &Map<String, Value>, path: &str) {
    for (candidate, allowed) in [
        ("filtered_history", &FILTERED_HISTORY_FIELDS),
        ("clean_foundation", &CLEAN_FOUNDATION_FIELDS),
    ] {
        let Some(cfg) = metrics.get(candidate) else {
            continue;
        };
        let cpath = format!("{path}.{candidate}");
        let Some(cfg) = c.object(Some(cfg), &cpath) else {
            continue;
        };

        let extra: Vec<&str> = cfg
            .keys()
            .map(String::as_str)
            .filter(|k| !allowed.iter().any(|(m, _)| m == k))
            .collect();
        if !extra.is_empty() {
            c.schema(
                "schema.unsupported",
                &cpath,
                format!("`{cpath}` has unsupported metrics: {}", extra.join(", ")),
            );
        }

        for (metric, fields) in allowed.iter() {
            let Some(metric_cfg) = cfg.get(*metric) else {
                continue;
            };
            let mpath = format!("{cpath}.{metric}");
            let Some(metric_cfg) = c.object(Some(metric_cfg), &mpath) else {
                continue;
            };
            let extra: Vec<&str> = metric_cfg
                .keys()
                .map(String::as_str)
                .filter(|k| !fields.contains(k))
                .collect();
            if !extra.is_empty() {
                c.schema(
                    "schema.unsupported",
                    &mpath,
                    format!("`{mpath}` has unsupported fields: {}", extra.join(", ")),
                );
            }
            for (key, value) in metric_cfg {
                if fields.contains(&key.as_str()) {
                    c.number(Some(value), &format!("{mpath}.{key}"), 0.0, None);
                }
            }
        }
    }
}

fn check_manifest(c: &mut Checker, doc: &Value, ctx: &str, source_root: Option<&Path>) {
    let Some(manifest) = c.root(doc, ctx) else {
        return;
    };

    c.integer(manifest.get("version"), &format!("{ctx}.version"), 1);
    c.non_empty_str(manifest.get("package_name"), &format!("{ctx}.package_name"));

    let req_path = format!("{ctx}.required_files");
    let required = c.string_list(manifest.get("required_files"), &req_path, false, true);
    let mut safe_required = Vec::with_capacity(required.len());
    for (i, rel) in required.iter().enumerate() {
        match paths::normalize_relative(rel) {
            Ok(norm) => safe_required.push((i, norm)),
            Err(e) => c.traversal(
                "manifest.unsafe_path",
                &format!("{req_path}[{i}]"),
                e.to_string(),
            ),
        }
    }

    let optional_path = format!("{ctx}.optional_globs");
    let optional = optional_list(c, manifest.get("optional_globs"), &optional_path);
    check_glob_patterns(c, &optional, &optional_path);

    let exclude_path = format!("{ctx}.exclude_globs");
    let exclude = optional_list(c, manifest.get("exclude_globs"), &exclude_path);
    check_glob_patterns(c, &exclude, &exclude_path);

    if !safe_required.is_empty()
        && !exclude.is_empty()
        && safe_required
            .iter()
            .all(|(_, rel)| paths::glob_matches_any(rel, &exclude))
    {
        c.invariant(
            "manifest.exclusions_cover_required",
            &exclude_path,
            "exclusion patterns match every required file; required files cannot be excluded",
        );
    }

    if let Some(root) = source_root {
        for (i, rel) in &safe_required {
            let at = format!("{req_path}[{i}]");
            match paths::resolve_safe_child(root, rel) {
                Err(e) => c.traversal("manifest.required_escape", &at, e.to_string()),
                Ok(file) if !file.is_file() => c.invariant(
                    "manifest.required_missing",
                    &at,
                    format!("required file `{rel}` not found under {}", root.display()),
                ),
                Ok(_) => {}
            }
        }
    }
}

fn optional_list(c: &mut Checker, value: Option<&Value>, path: &str) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(v) => c.string_list(Some(v), path, true, true),
    }
}

fn check_glob_patterns(c: &mut Checker, patterns: &[String], path: &str) {
    for (i, pattern) in patterns.iter().enumerate() {
        let ipath = format!("{path}[{i}]");
        if pattern.starts_with('/') {
            c.traversal(
                "manifest.absolute_pattern",
                &ipath,
                format!("pattern `{pattern}` must be relative"),
            );
        } else if pattern.split('/').any(|seg| seg == "..") {
            c.traversal(
                "manifest.pattern_traversal",
                &ipath,
                format!("pattern `{pattern}` must not contain `..`"),
            );
        }
    }
}

fn check_extension(c: &mut Checker, doc: &Value, ctx: &str) {
    let Some(ext) = c.root(doc, ctx) else {
        return;
    };

    c.non_empty_str(ext.get("name"), &format!("{ctx}.name"));
    c.non_empty_str(ext.get("version"), &format!("{ctx}.version"));
    if let Some(desc) = ext.get("description").filter(|d| !d.is_null()) {
        c.non_empty_str(Some(desc), &format!("{ctx}.description"));
    }
    c.string_list(
        ext.get("capabilities"),
        &format!("{ctx}.capabilities"),
        false,
        true,
    );

    check_commands(c, ext, ctx);

    let ep_path = format!("{ctx}.entrypoints");
    let listed: Vec<(String, Option<&Value>)> = match ext.get("entrypoints") {
        None | Some(Value::Null) => {
            c.required(&ep_path);
            return;
        }
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (format!("{ep_path}.{k}"), Some(v)))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("{ep_path}[{i}]"), Some(v)))
            .collect(),
        Some(_) => {
            c.schema(
                "schema.type",
                &ep_path,
                format!("`{ep_path}` must be an object or a list of paths"),
            );
            return;
        }
    };
    if listed.is_empty() {
        c.schema("schema.empty", &ep_path, format!("`{ep_path}` must not be empty"));
    }
    for (path, value) in listed {
        if let Some(rel) = c.non_empty_str(value, &path) {
            if let Err(e) = paths::ensure_safe_relative(rel) {
                c.traversal("extension.entrypoint_unsafe", &path, e.to_string());
            }
        }
    }
}

fn check_commands(c: &mut Checker, ext: &Map<String, Value>, ctx: &str) {
    let path = format!("{ctx}.commands");
    let commands = match ext.get("commands") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            c.schema(
                "schema.type",
                &path,
                format!("`{path}` must map command keys to paths"),
            );
            None
        }
    };

    let contract_path = format!("{ctx}.command_contract");
    let contract = match ext.get("command_contract") {
        None | Some(Value::Null) if commands.is_some_and(|m| !m.is_empty()) => {
            c.schema(
                "schema.required",
                &contract_path,
                format!("`{contract_path}` is required when commands are declared"),
            );
            None
        }
        None | Some(Value::Null) => None,
        Some(v) => c.object(Some(v), &contract_path),
    };
    let namespace = contract.and_then(|contract| {
        c.integer(
            contract.get("version"),
            &format!("{contract_path}.version"),
            1,
        );
        c.non_empty_str(
            contract.get("namespace"),
            &format!("{contract_path}.namespace"),
        )
    });

    let expected = ext
        .get("name")
        .and_then(Value::as_str)
        .map(normalize_slug)
        .filter(|s| !s.is_empty());
    if let (Some(namespace), Some(expected)) = (namespace, expected.as_deref()) {
        if namespace != expected {
            c.invariant(
                "extension.namespace_mismatch",
                &format!("{contract_path}.namespace"),
                format!("namespace `{namespace}` must be `{expected}`, derived from the extension name"),
            );
        }
    }

    let Some(commands) = commands else {
        return;
    };
    let prefix = namespace.or(expected.as_deref());
    for (key, value) in commands {
        let cpath = format!("{path}.{key}");
        if let Some(prefix) = prefix {
            let slug = key.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/'));
            let well_formed = slug.is_some_and(|s| !s.is_empty() && normalize_slug(s) == s);
            if !well_formed {
                c.invariant(
                    "extension.command_not_namespaced",
                    &cpath,
                    format!("command key `{key}` must look like `{prefix}/<command>`; run contracts-migrate"),
                );
            }
        }
        if let Some(rel) = c.non_empty_str(Some(value), &cpath) {
            if let Err(e) = paths::ensure_safe_relative(rel) {
                c.traversal("extension.command_unsafe", &cpath, e.to_string());
            }
        }
    }
}

fn check_contract_policy(c: &mut Checker, doc: &Value, ctx: &str) {
    let Some(policy) = c.root(doc, ctx) else {
        return;
    };
    c.integer(policy.get("version"), &format!("{ctx}.version"), 1);

    let path = format!("{ctx}.targets");
    let Some(targets) = c.object(policy.get("targets"), &path) else {
        return;
    };
    let path = format!("{path}.extension_command_contract");
    let Some(target) = c.object(targets.get("extension_command_contract"), &path) else {
        return;
    };
    let version_path = format!("{path}.current_version");
    if let Some(version) = c.integer(target.get("current_version"), &version_path, 1) {
        if version > COMMAND_CONTRACT_VERSION {
            c.invariant(
                "contract_policy.unsupported_version",
                &version_path,
                format!(
                    "command contract version {version} is newer than the supported {COMMAND_CONTRACT_VERSION}"
                ),
            );
        }
    }
    for key in ["migration_script", "notes"] {
        if let Some(v) = target.get(key).filter(|v| !v.is_null()) {
            c.string(Some(v), &format!("{path}.{key}"));
        }
    }
}

const PACKAGE_KEYS: [&str; 10] = [
    "package_version",
    "manifest_version",
    "package_name",
    "created_at",
    "source_root",
    "mode",
    "entry_count",
    "entries",
    "package_checksum",
    "manifest",
];

fn check_package(c: &mut Checker, doc: &Value, ctx: &str) {
    let Some(pkg) = c.root(doc, ctx) else {
        return;
    };

    let missing: Vec<&str> = PACKAGE_KEYS
        .iter()
        .copied()
        .filter(|k| !pkg.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        c.schema(
            "schema.required",
            ctx,
            format!("`{ctx}` missing required keys: {}", missing.join(", ")),
        );
    }

    if let Some(v) = pkg.get("package_version") {
        let path = format!("{ctx}.package_version");
        if let Some(version) = c.integer(Some(v), &path, 1) {
            if (version as u64) > PACKAGE_FORMAT_VERSION {
                c.schema(
                    "package.unsupported_version",
                    &path,
                    format!(
                        "package format {version} is newer than supported {PACKAGE_FORMAT_VERSION}"
                    ),
                );
            }
        }
    }
    if let Some(v) = pkg.get("manifest_version") {
        c.integer(Some(v), &format!("{ctx}.manifest_version"), 1);
    }
    for key in ["package_name", "created_at", "source_root"] {
        if let Some(v) = pkg.get(key) {
            c.non_empty_str(Some(v), &format!("{ctx}.{key}"));
        }
    }
    if let Some(v) = pkg.get("mode") {
        let path = format!("{ctx}.mode");
        if let Some(mode) = c.string(Some(v), &path) {
            if mode != "dry-run" && mode != "full" {
                c.schema(
                    "schema.enum",
                    &path,
                    format!("`{path}` must be `dry-run` or `full`, got `{mode}`"),
                );
            }
        }
    }

    let entries = check_package_entries(c, pkg, ctx);

    if let (Some(entries), Some(recorded)) = (
        entries,
        pkg.get("package_checksum").and_then(|v| v.as_str()),
    ) {
        let actual = digest::aggregate_checksum(&entries);
        if actual != recorded {
            c.report.error(
                ViolationKind::IntegrityViolation,
                "package.aggregate_mismatch",
                format!("{ctx}.package_checksum"),
                format!("recorded aggregate {recorded} does not match entries ({actual})"),
            );
        }
    } else if let Some(v) = pkg.get("package_checksum") {
        c.string(Some(v), &format!("{ctx}.package_checksum"));
    }

    if let Some(v) = pkg.get("manifest") {
        check_manifest(c, v, &format!("{ctx}.manifest"), None);
    }
}

/// Returns the parsed entries when every one of them is well formed.
fn check_package_entries(
    c: &mut Checker,
    pkg: &Map<String, Value>,
    ctx: &str,
) -> Option<Vec<PackageEntry>> {
    let path = format!("{ctx}.entries");
    let items = match pkg.get("entries") {
        None => return None,
        Some(Value::Array(items)) => items,
        Some(_) => {
            c.schema("schema.type", &path, format!("`{path}` must be a list"));
            return None;
        }
    };

    if let Some(v) = pkg.get("entry_count") {
        let count_path = format!("{ctx}.entry_count");
        if let Some(count) = c.integer(Some(v), &count_path, 0) {
            if count as usize != items.len() {
                c.invariant(
                    "package.entry_count_mismatch",
                    &count_path,
                    format!("entry_count is {count} but {} entries are listed", items.len()),
                );
            }
        }
    }

    let mut parsed = Vec::with_capacity(items.len());
    let mut well_formed = true;
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let epath = format!("{path}[{i}]");
        let Some(entry) = c.object(Some(item), &epath) else {
            well_formed = false;
            continue;
        };

        let rel = c.non_empty_str(entry.get("path"), &format!("{epath}.path"));
        if let Some(rel) = rel {
            if let Err(e) = paths::ensure_safe_relative(rel) {
                c.traversal("package.unsafe_path", &format!("{epath}.path"), e.to_string());
            }
            if !seen.insert(rel) {
                c.invariant(
                    "package.duplicate_entry",
                    &format!("{epath}.path"),
                    format!("entry `{rel}` is listed more than once"),
                );
            }
        }

        let sha = c.non_empty_str(entry.get("sha256"), &format!("{epath}.sha256"));
        let sha = match sha {
            Some(s) if digest::is_sha256_hex(s) => Some(s),
            Some(_) => {
                c.schema(
                    "package.bad_digest",
                    &format!("{epath}.sha256"),
                    "sha256 must be a 64-char lowercase hex string",
                );
                None
            }
            None => None,
        };

        let size = c.integer(entry.get("size_bytes"), &format!("{epath}.size_bytes"), 0);

        match (rel, sha, size) {
            (Some(rel), Some(sha), Some(size)) => parsed.push(PackageEntry {
                path: rel.to_string(),
                sha256: sha.to_string(),
                size_bytes: size as u64,
            }),
            _ => well_formed = false,
        }
    }

    if well_formed {
        Some(parsed)
    } else {
        None
    }
}
