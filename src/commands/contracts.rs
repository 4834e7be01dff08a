use crate::cli::{Cli, Commands};
use crate::domain::models::{ContractsCheckReport, ExtensionCheckReport, SchemaKind, ValidationReport};
use crate::services::contracts::{self, ValidateOptions};
use crate::services::output::{print_report, render_findings};
use crate::services::migrate::{self, MigrateOptions};
use crate::services::registry;
use crate::services::storage::{resolve_under, ToolConfig};

/// `None` when the command belongs to another handler.
pub fn handle_contract_commands(cli: &Cli, config: &ToolConfig) -> anyhow::Result<Option<bool>> {
    match &cli.command {
        Commands::ContractsCheck {
            policy,
            manifest,
            extensions_dir,
            contract_policy,
            source_root,
            strict,
        } => {
            let policy = resolve_under(&cli.repo, policy.as_deref(), &config.paths.policy);
            let manifest = resolve_under(&cli.repo, manifest.as_deref(), &config.paths.manifest);
            let extensions_dir = resolve_under(
                &cli.repo,
                extensions_dir.as_deref(),
                &config.paths.extensions_dir,
            );
            let contract_policy = resolve_under(
                &cli.repo,
                contract_policy.as_deref(),
                &config.paths.contract_policy,
            );
            tracing::info!(
                policy = %policy.display(),
                manifest = %manifest.display(),
                extensions = %extensions_dir.display(),
                strict = *strict,
                "running contracts check"
            );

            let opts = ValidateOptions {
                strict: *strict,
                source_root: source_root.as_deref(),
            };
            let mut report = ValidationReport::new();

            let policy_doc = contracts::load_for_validation(&policy, "policy", &mut report);
            if let Some(doc) = &policy_doc {
                report.extend(contracts::validate(doc, SchemaKind::Policy, &opts));
            }
            if let Some(doc) = contracts::load_for_validation(&manifest, "manifest", &mut report) {
                report.extend(contracts::validate(&doc, SchemaKind::Manifest, &opts));
            }
            let contract_doc =
                contracts::load_for_validation(&contract_policy, "contract_policy", &mut report);
            if let Some(doc) = &contract_doc {
                report.extend(contracts::validate(doc, SchemaKind::ContractPolicy, &opts));
            }

            let scan = registry::scan(&extensions_dir, *strict);
            report.extend(scan.report.clone());
            if let Some(doc) = &policy_doc {
                report.extend(contracts::check_capability_references(
                    doc,
                    &scan.descriptors,
                    *strict,
                ));
            }
            if let Some(doc) = &contract_doc {
                report.extend(contracts::check_command_contracts(
                    doc,
                    &scan.descriptors,
                    *strict,
                ));
            }

            let out = ContractsCheckReport {
                strict: *strict,
                policy: policy.display().to_string(),
                manifest: manifest.display().to_string(),
                contract_policy: contract_policy.display().to_string(),
                extensions_dir: extensions_dir.display().to_string(),
                extensions: scan.names(),
                capabilities: scan.capabilities(),
                commands: scan.commands(),
                report,
            };
            let ok = out.report.is_ok();
            print_report(cli.json, ok, out, |r| {
                format!(
                    "contracts-check: {} ({} extension(s), strict={})\n{}",
                    if ok { "ok" } else { "FAILED" },
                    r.extensions.len(),
                    r.strict,
                    render_findings(&r.report)
                )
            })?;
            Ok(Some(ok))
        }
        Commands::ExtensionCheck {
            extensions_dir,
            strict,
        } => {
            let extensions_dir = resolve_under(
                &cli.repo,
                extensions_dir.as_deref(),
                &config.paths.extensions_dir,
            );
            let scan = registry::scan(&extensions_dir, *strict);
            let out = ExtensionCheckReport {
                strict: *strict,
                extensions_dir: extensions_dir.display().to_string(),
                extensions: scan.names(),
                report: scan.report,
            };
            let ok = out.report.is_ok();
            print_report(cli.json, ok, out, |r| {
                format!(
                    "extension-check: {} ({})\n{}",
                    if ok { "ok" } else { "FAILED" },
                    r.extensions.join(", "),
                    render_findings(&r.report)
                )
            })?;
            Ok(Some(ok))
        }
        Commands::ContractsMigrate {
            extensions_dir,
            contract_policy,
            write,
        } => {
            let extensions_dir = resolve_under(
                &cli.repo,
                extensions_dir.as_deref(),
                &config.paths.extensions_dir,
            );
            let contract_policy = resolve_under(
                &cli.repo,
                contract_policy.as_deref(),
                &config.paths.contract_policy,
            );
            let out = migrate::migrate(
                &contract_policy,
                &extensions_dir,
                &MigrateOptions { write: *write },
            );
            let ok = out.report.is_ok();
            print_report(cli.json, ok, out, |r| {
                let mut text = format!(
                    "contracts-migrate ({}): {} inspected, {} needing migration",
                    if r.write { "write" } else { "dry run" },
                    r.inspected,
                    r.changed.len()
                );
                for path in &r.changed {
                    text.push_str(&format!("\n- {path}"));
                }
                if !r.write && !r.changed.is_empty() {
                    text.push_str("\nNo files were modified. Re-run with --write to apply.");
                }
                format!("{text}\n{}", render_findings(&r.report))
            })?;
            Ok(Some(ok))
        }
        _ => Ok(None),
    }
}
