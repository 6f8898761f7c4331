use std::path::PathBuf;

use clap::{Parser, Subcommand};

use arbor::config::Config;
use arbor::orchestration::check_tree;
use arbor::store::{JsonFileStore, NodeStore};
use arbor::tree::{AgentNode, NodeId};
use arbor::{alog, Error, Result};

/// Arbor - inspect recursive agent trees
#[derive(Parser, Debug)]
#[command(name = "arbor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    ARBOR_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.arbor/arbor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// State snapshot to read (default: state_file from ~/.arbor/arbor.toml)
    #[arg(long)]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List every tree
    Roots,

    /// Show a node and its subtree
    Show {
        /// Node id (full UUID or unique prefix)
        node: String,
    },

    /// Print the phase transitions and coordination events of a node
    Events {
        /// Node id (full UUID or unique prefix)
        node: String,
    },

    /// Check the invariants of a tree
    Verify {
        /// Root id (full UUID or unique prefix)
        root: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    arbor::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    let path = match cli.state {
        Some(path) => path,
        None => config.state_path()?,
    };
    alog!("arbor {:?} over {}", cli.command, path.display());
    let store = JsonFileStore::open(&path)?;

    match cli.command {
        Command::Roots => run_roots(&store),
        Command::Show { node } => run_show(&store, &node),
        Command::Events { node } => run_events(&store, &node),
        Command::Verify { root } => run_verify(&store, &root),
    }
}

fn run_roots(store: &dyn NodeStore) -> Result<()> {
    let roots = store.roots()?;
    if roots.is_empty() {
        println!("No trees.");
        return Ok(());
    }
    println!(
        "{:<10} {:<10} {:<10} {:>12} {:<}",
        "ID", "STATUS", "PHASE", "COST", "TASK"
    );
    for root in roots {
        println!(
            "{:<10} {:<10} {:<10} {:>12} {}",
            root.id.short(),
            root.status,
            root.phase,
            root.cost_subtree,
            truncate_string(&root.task, 50)
        );
    }
    Ok(())
}

fn run_show(store: &dyn NodeStore, query: &str) -> Result<()> {
    let id = resolve_node(store, query)?;
    let nodes = store.read_subtree(id)?;
    let base_depth = nodes.first().map(|n| n.tree_depth).unwrap_or(0);

    for node in depth_first(&nodes, id) {
        let indent = "  ".repeat((node.tree_depth - base_depth) as usize);
        println!("{}{}", indent, describe(node));
    }
    if let Some(node) = nodes.first() {
        println!();
        println!("  Branch:      {}", node.branch_name);
        if let Some(ref parent_branch) = node.parent_branch_name {
            println!("  Parent:      {}", parent_branch);
        }
        println!("  Owner:       {}", node.owner);
        println!("  Tokens:      {} local / {} subtree", node.tokens_local, node.tokens_subtree);
        println!("  Cost:        {} local / {} subtree", node.cost_local, node.cost_subtree);
        println!("  Created:     {}", node.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(ended) = node.end_time {
            println!("  Ended:       {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(ref reason) = node.failure_reason {
            println!("  Failure:     {}", reason);
        }
        if let Some(ref report) = node.completion_result {
            println!("  Result:      {}", truncate_string(&report.summary, 60));
        }
    }
    Ok(())
}

fn run_events(store: &dyn NodeStore, query: &str) -> Result<()> {
    let id = resolve_node(store, query)?;
    for t in store.phase_transitions(id)? {
        println!(
            "{}  phase  {} -> {} ({} ms, confidence {:.2}) {}",
            t.timestamp.format("%H:%M:%S%.3f"),
            t.from_phase,
            t.to_phase,
            t.duration_ms,
            t.confidence,
            truncate_string(&t.summary, 60)
        );
    }
    for e in store.coordination_events(id)? {
        println!(
            "{}  {:<20} {}",
            e.timestamp.format("%H:%M:%S%.3f"),
            e.kind,
            e.detail
        );
    }
    Ok(())
}

fn run_verify(store: &dyn NodeStore, query: &str) -> Result<()> {
    let id = resolve_node(store, query)?;
    let violations = check_tree(store, id)?;
    if violations.is_empty() {
        println!("Tree {} is consistent.", id.short());
        return Ok(());
    }
    for violation in &violations {
        println!("  • {}", violation);
    }
    Err(Error::InvariantViolation {
        root: id,
        detail: format!("{} violation(s)", violations.len()),
    })
}

/// Accept a full UUID or a unique prefix of one.
fn resolve_node(store: &dyn NodeStore, query: &str) -> Result<NodeId> {
    if let Ok(id) = query.parse::<NodeId>() {
        return Ok(id);
    }
    let mut matches = Vec::new();
    for root in store.roots()? {
        for node in store.read_subtree(root.id)? {
            if node.id.to_string().starts_with(query) {
                matches.push(node.id);
            }
        }
    }
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(Error::Validation(format!("No node matches '{}'", query))),
        _ => Err(Error::Validation(format!(
            "'{}' is ambiguous ({} nodes match)",
            query,
            matches.len()
        ))),
    }
}

fn depth_first(nodes: &[AgentNode], start: NodeId) -> Vec<&AgentNode> {
    let mut out = Vec::with_capacity(nodes.len());
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if let Some(node) = nodes.iter().find(|n| n.id == id) {
            out.push(node);
            let mut kids: Vec<&AgentNode> = nodes.iter().filter(|n| n.parent_id == Some(id)).collect();
            kids.sort_by_key(|n| std::cmp::Reverse(n.execution_order));
            stack.extend(kids.into_iter().map(|n| n.id));
        }
    }
    out
}

fn describe(node: &AgentNode) -> String {
    let merge = node
        .merge_status
        .map(|m| format!(" [{}]", m))
        .unwrap_or_default();
    format!(
        "{} #{} {} {} {}{} {}",
        node.id.short(),
        node.execution_order,
        node.specialization,
        node.status,
        node.phase,
        merge,
        truncate_string(&node.task, 40)
    )
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
