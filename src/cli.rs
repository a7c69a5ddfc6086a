//! CLI struct definitions and dispatch for the operator surface.
//!
//! This is an admin surface over the same kernel singletons agent code is
//! mediated through; it is not the agent surface and not an approval UI.

use crate::kernel::audit::{AuditFilter, AuditResult, ExportFormat};
use crate::kernel::capability::{Constraints, RiskTier};
use crate::kernel::config::KernelConfig;
use crate::kernel::store::Store;
use crate::kernel::{Kernel, db};
use crate::runtime::AgentRuntime;
use crate::kernel::approval::{ApprovalDecision, AutoApprover};
use crate::kernel::renderer::MockRenderer;
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(Parser, Debug)]
#[clap(
    name = "portcullis",
    version = env!("CARGO_PKG_VERSION"),
    about = "Portcullis is the local-first browser kernel that mediates agent code against browser-local state: capability-checked, fully audited, transactionally reversible."
)]
pub struct Cli {
    /// Store root (defaults to ./.portcullis)
    #[clap(long, global = true)]
    pub store: Option<PathBuf>,
    /// Optional kernel config file (JSON)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize the durable store
    Init,
    /// Audit log inspection
    Audit {
        #[clap(subcommand)]
        command: AuditCommand,
    },
    /// Capability administration
    Caps {
        #[clap(subcommand)]
        command: CapsCommand,
    },
    /// Run an agent program file against the kernel (mock renderer)
    Run {
        /// Path to a JSON program
        program: PathBuf,
        #[clap(long, default_value = "agent:1")]
        principal: String,
        /// Collect required capabilities instead of executing
        #[clap(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Render recent entries as a timeline
    Timeline {
        /// Output format: 'text' or 'json'
        #[clap(long, default_value = "text")]
        format: String,
        /// Limit to N most recent entries
        #[clap(long, default_value = "100")]
        limit: usize,
        /// Restrict to one principal's stream
        #[clap(long)]
        principal: Option<String>,
        /// Glob over operation names (e.g. 'tab.*')
        #[clap(long)]
        op: Option<String>,
    },
    /// Export entries (jsonl or markdown)
    Export {
        #[clap(long, default_value = "jsonl")]
        format: String,
        /// Output file path (stdout if not specified)
        #[clap(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CapsCommand {
    /// List capabilities issued to a principal this process
    List {
        principal: String,
    },
    /// Issue a capability
    Grant {
        principal: String,
        operation: String,
        resource: String,
        /// Risk tier: T1_READ, T2_STATEFUL, T3_IRREVERSIBLE
        #[clap(long, default_value = "T1_READ")]
        tier: String,
        /// Expiry, seconds from now
        #[clap(long)]
        ttl_secs: Option<u64>,
    },
    /// Revoke one capability by id (durable)
    Revoke {
        cap_id: String,
    },
    /// Revoke every capability held by a principal (durable)
    RevokeAll {
        principal: String,
    },
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let root = cli.store.unwrap_or_else(|| PathBuf::from(".portcullis"));
    let store = Store::at(&root);
    let config = cli
        .config
        .map(|p| KernelConfig::maybe_load(&p))
        .unwrap_or_default();

    match cli.command {
        Command::Init => {
            db::initialize_kernel_db(&store).context("initialize kernel store")?;
            println!("Initialized kernel store at {}", store.root.display());
            Ok(())
        }
        Command::Audit { command } => run_audit(&store, &config, command),
        Command::Caps { command } => run_caps(&store, &config, command),
        Command::Run {
            program,
            principal,
            dry_run,
        } => run_program(&store, &config, &program, &principal, dry_run),
    }
}

fn run_audit(store: &Store, config: &KernelConfig, command: AuditCommand) -> anyhow::Result<()> {
    let kernel = Kernel::init(store.clone(), config.clone()).context("open kernel")?;
    match command {
        AuditCommand::Timeline {
            format,
            limit,
            principal,
            op,
        } => {
            let entries = kernel.audit.query(&AuditFilter {
                principal,
                op_glob: op,
                limit: Some(limit),
                ..Default::default()
            })?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            println!(
                "{:<18} {:<24} {:<14} {:<9} {}",
                "TIME", "OP", "PRINCIPAL", "RESULT", "OBJECT"
            );
            println!("{}", "-".repeat(78));
            for entry in &entries {
                let result = match entry.result {
                    AuditResult::Success => entry.result.as_str().green(),
                    AuditResult::Denied => entry.result.as_str().yellow(),
                    AuditResult::Error => entry.result.as_str().red(),
                };
                println!(
                    "{:<18.6} {:<24} {:<14} {:<9} {}",
                    entry.ts,
                    truncate(&entry.op, 24),
                    truncate(&entry.principal, 14),
                    result,
                    entry.object_id.as_deref().unwrap_or("-"),
                );
            }
            println!("{}", "-".repeat(78));
            println!("{} entries", entries.len());
            Ok(())
        }
        AuditCommand::Export { format, output } => {
            let format = match format.as_str() {
                "jsonl" => ExportFormat::Jsonl,
                "markdown" | "md" => ExportFormat::Markdown,
                other => bail!("unknown export format '{}'", other),
            };
            let filter = AuditFilter::default();
            match output {
                Some(path) => {
                    let mut file = std::fs::File::create(&path)?;
                    let count = kernel.audit.export(format, &filter, &mut file)?;
                    println!("Exported {} entries to {}", count, path.display());
                }
                None => {
                    kernel.audit.export(format, &filter, &mut std::io::stdout())?;
                }
            }
            Ok(())
        }
    }
}

fn run_caps(store: &Store, config: &KernelConfig, command: CapsCommand) -> anyhow::Result<()> {
    let kernel = Kernel::init(store.clone(), config.clone()).context("open kernel")?;
    match command {
        CapsCommand::List { principal } => {
            let caps = kernel.broker.list(&principal)?;
            for cap in &caps {
                let status = if cap.revoked { "revoked".red() } else { "live".green() };
                println!(
                    "{}  {}  {} on {}  [{}]",
                    cap.id,
                    status,
                    cap.operation_pattern,
                    cap.resource_pattern,
                    cap.risk_tier.as_str()
                );
            }
            println!("{} capabilities", caps.len());
            Ok(())
        }
        CapsCommand::Grant {
            principal,
            operation,
            resource,
            tier,
            ttl_secs,
        } => {
            let tier = RiskTier::parse(&tier)
                .ok_or_else(|| anyhow::anyhow!("unknown risk tier '{}'", tier))?;
            let expires_at = ttl_secs.map(|t| crate::kernel::time::now_secs() + t as f64);
            let cap_id = kernel.broker.grant(
                &principal,
                &operation,
                &resource,
                tier,
                expires_at,
                Constraints::default(),
            )?;
            println!("Granted {}", cap_id);
            Ok(())
        }
        CapsCommand::Revoke { cap_id } => {
            kernel.broker.revoke(&cap_id, "operator")?;
            println!("Revoked {}", cap_id);
            Ok(())
        }
        CapsCommand::RevokeAll { principal } => {
            let count = kernel.broker.revoke_all(&principal)?;
            println!("Revoked {} capabilities for {}", count, principal);
            Ok(())
        }
    }
}

fn run_program(
    store: &Store,
    config: &KernelConfig,
    program: &std::path::Path,
    principal: &str,
    dry_run: bool,
) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(program)
        .with_context(|| format!("read program {}", program.display()))?;
    let kernel = Kernel::init(store.clone(), config.clone()).context("open kernel")?;
    let runtime = AgentRuntime::new(
        &kernel,
        Arc::new(MockRenderer::new()),
        Arc::new(AutoApprover::new(ApprovalDecision::Deny)),
    );

    if dry_run {
        match runtime.dry_run(principal, &source) {
            Ok(required) => {
                println!("Required capabilities:");
                for cap in required {
                    println!("  {} on {}  [{}]", cap.op, cap.resource, cap.tier.as_str());
                }
            }
            Err(errors) => print_validation_errors(&errors),
        }
        return Ok(());
    }

    match runtime.submit(principal, &source, Arc::new(AtomicBool::new(false))) {
        Ok(result) => {
            println!(
                "State: {}  ({} privileged calls)",
                result.state.as_str(),
                result.ops_used
            );
            if let Some(error) = result.error {
                println!("Error: {}", error);
            }
            if let (Some(first), Some(last)) = result.audit_range {
                println!("Audit range: {} .. {}", first, last);
            }
        }
        Err(errors) => print_validation_errors(&errors),
    }
    kernel.shutdown()?;
    Ok(())
}

fn print_validation_errors(errors: &[crate::runtime::program::ValidationError]) {
    println!("{}", "Submission refused:".red());
    for error in errors {
        println!("  [{}] {}: {}", error.rule, error.location, error.message);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max - 3])
    } else {
        s.to_string()
    }
}
