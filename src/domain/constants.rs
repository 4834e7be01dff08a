pub const PACKAGE_FORMAT_VERSION: u64 = 1;

pub const PACKAGE_MANIFEST_FILE: &str = "package_manifest.json";
pub const CHECKSUM_SIDECAR_FILE: &str = "checksums.sha256";
pub const PAYLOAD_DIR: &str = "payload";

pub const EXTENSION_DESCRIPTOR_FILE: &str = "manifest.json";

pub const DEFAULT_POLICY_PATH: &str = "config/migration_sync_policy.json";
pub const DEFAULT_MANIFEST_PATH: &str = "config/state_migration_manifest.json";
pub const DEFAULT_EXTENSIONS_DIR: &str = "extensions";
pub const DEFAULT_CONTRACT_POLICY_PATH: &str = "config/delta_contract_policy.json";
pub const TOOL_CONFIG_PATH: &str = "config/delta-kit.toml";

/// Highest extension command contract version this build understands.
pub const COMMAND_CONTRACT_VERSION: i64 = 1;

/// Scorecard metrics every policy weight set must cover.
pub const METRIC_KEYS: [&str; 4] = [
    "privacy_risk",
    "simplicity",
    "merge_conflict_risk",
    "auditability",
];

/// Coefficients accepted per metric in `history_metrics.filtered_history`.
pub const FILTERED_HISTORY_FIELDS: [(&str, &[&str]); 4] = [
    ("privacy_risk", &["base", "block_penalty", "ambiguous_penalty"]),
    (
        "simplicity",
        &["base", "commit_divisor", "commit_cap", "ambiguous_penalty"],
    ),
    (
        "merge_conflict_risk",
        &["base", "commit_divisor", "commit_cap", "ambiguous_penalty"],
    ),
    ("auditability", &["base", "block_penalty", "ambiguous_penalty"]),
];

/// Coefficients accepted per metric in `history_metrics.clean_foundation`.
pub const CLEAN_FOUNDATION_FIELDS: [(&str, &[&str]); 4] = [
    ("privacy_risk", &["base"]),
    (
        "simplicity",
        &["base", "commit_bonus_divisor", "commit_bonus_cap"],
    ),
    ("merge_conflict_risk", &["base"]),
    ("auditability", &["base"]),
];

pub const WEIGHT_NORMALIZATION_TOLERANCE: f64 = 1e-6;
