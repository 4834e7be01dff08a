use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "delta",
    version,
    about = "Contract checks and state migration packages"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Repository root that relative default paths resolve against"
    )]
    pub repo: PathBuf,
    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Raise log verbosity (-v info, -vv debug)"
    )]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate policy, state manifest and extension descriptors together.
    ContractsCheck {
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long)]
        manifest: Option<PathBuf>,
        #[arg(long)]
        extensions_dir: Option<PathBuf>,
        #[arg(long)]
        contract_policy: Option<PathBuf>,
        #[arg(long, help = "Also require manifest files to exist under this root")]
        source_root: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Validate extension descriptors only.
    ExtensionCheck {
        #[arg(long)]
        extensions_dir: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Move extension commands onto the current namespaced command contract.
    ContractsMigrate {
        #[arg(long)]
        extensions_dir: Option<PathBuf>,
        #[arg(long)]
        contract_policy: Option<PathBuf>,
        #[arg(long, default_value_t = false, help = "Rewrite descriptors in place")]
        write: bool,
    },
    /// Build a migration package from the state manifest.
    StateExport {
        #[arg(long)]
        manifest: Option<PathBuf>,
        #[arg(long, help = "Source tree to package (defaults to --repo)")]
        source_root: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = false, help = "Write a manifest-only preview")]
        dry_run: bool,
        #[arg(long, default_value_t = false, help = "Replace a non-empty output directory")]
        force: bool,
    },
    /// Audit a package without modifying it.
    StateCheck {
        #[arg(long)]
        package: PathBuf,
        #[arg(long, default_value_t = false, help = "Skip payload byte comparisons")]
        dry_run: bool,
    },
    /// Apply a package to a destination tree.
    StateImport {
        #[arg(long)]
        package: PathBuf,
        #[arg(long, default_value = ".")]
        target: PathBuf,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false, help = "Write directly without staging")]
        no_atomic: bool,
        #[arg(long, default_value_t = false)]
        allow_overwrite: bool,
    },
}
