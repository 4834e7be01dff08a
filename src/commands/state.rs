use crate::cli::{Cli, Commands};
use crate::domain::models::PackageMode;
use crate::services::auditor::{self, AuditOptions};
use crate::services::builder::{self, BuildOptions};
use crate::services::importer::{self, ImportOptions};
use crate::services::output::{print_report, render_findings};
use crate::services::storage::{resolve_under, ToolConfig};

/// `None` when the command belongs to another handler.
pub fn handle_state_commands(cli: &Cli, config: &ToolConfig) -> anyhow::Result<Option<bool>> {
    match &cli.command {
        Commands::StateExport {
            manifest,
            source_root,
            out,
            dry_run,
            force,
        } => {
            let manifest = resolve_under(&cli.repo, manifest.as_deref(), &config.paths.manifest);
            let source_root = source_root.clone().unwrap_or_else(|| cli.repo.clone());
            let opts = BuildOptions {
                mode: if *dry_run {
                    PackageMode::DryRun
                } else {
                    PackageMode::Full
                },
                force: *force,
            };
            let result = builder::export(&manifest, &source_root, out, &opts);
            let ok = result.report.is_ok();
            print_report(cli.json, ok, result, |r| {
                let mut lines = vec![format!(
                    "state-export: {} {} ({} entries, {} payload files)",
                    if ok { "wrote" } else { "FAILED" },
                    r.package_dir,
                    r.entry_count,
                    r.payload_files_copied
                )];
                if let Some(sum) = &r.package_checksum {
                    lines.push(format!("package_checksum: {sum}"));
                }
                for (top, n) in &r.by_top_level {
                    lines.push(format!("  {top}\t{n}"));
                }
                lines.push(render_findings(&r.report));
                lines.join("\n")
            })?;
            Ok(Some(ok))
        }
        Commands::StateCheck { package, dry_run } => {
            let result = auditor::check(package, &AuditOptions { dry_run: *dry_run });
            let ok = result.report.is_ok();
            print_report(cli.json, ok, result, |r| {
                format!(
                    "state-check: {} {} ({} entries)\n{}",
                    if ok { "ok" } else { "FAILED" },
                    r.package_dir,
                    r.entry_count,
                    render_findings(&r.report)
                )
            })?;
            Ok(Some(ok))
        }
        Commands::StateImport {
            package,
            target,
            dry_run,
            no_atomic,
            allow_overwrite,
        } => {
            let opts = ImportOptions {
                dry_run: *dry_run,
                atomic: !*no_atomic,
                allow_overwrite: *allow_overwrite || config.import.allow_overwrite,
            };
            let result = importer::import(package, target, &opts);
            let ok = result.report.is_ok();
            print_report(cli.json, ok, result, |r| {
                let mut lines = Vec::new();
                if r.dry_run {
                    lines.push(format!(
                        "state-import (dry run): {} write(s) planned into {}",
                        r.planned.len(),
                        r.destination
                    ));
                    lines.extend(r.planned.iter().map(|p| format!("  {p}")));
                } else {
                    lines.push(format!(
                        "state-import: {} applied, {} identical, into {}",
                        r.applied.len(),
                        r.skipped_identical.len(),
                        r.destination
                    ));
                }
                if r.rolled_back {
                    lines.push("rolled back: destination left unchanged".to_string());
                }
                if r.partially_applied {
                    lines.push("partially applied: destination holds a mix of old and new files".to_string());
                }
                lines.push(render_findings(&r.report));
                lines.join("\n")
            })?;
            Ok(Some(ok))
        }
        _ => Ok(None),
    }
}
