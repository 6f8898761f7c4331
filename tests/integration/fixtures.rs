//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Wiring an orchestrator over a real repository
//! - Canned phase reports

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tempfile::TempDir;

use arbor::config::Config;
use arbor::git::GitOps;
use arbor::orchestration::{CreditLedger, Orchestrator, SpawnOutcome, UnlimitedLedger};
use arbor::store::{MemoryStore, NodeStore};
use arbor::tree::{
    AgentNode, CompletionReport, ExploreReport, FoundationReport, NodeId, Phase, PhaseReport, PlanReport,
    Specialization, SummonReport, TreeEvent,
};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit on `main`.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Self { temp_dir, path };

        repo.git(&["init", "-q"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        std::fs::write(repo.path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-q", "-m", "Initial commit"]);
        repo.git(&["branch", "-M", "main"]);
        repo
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Commit one file on `branch`, then go back to `main`.
    pub fn commit_on(&self, branch: &str, filename: &str, content: &str) -> String {
        self.git(&["checkout", "-q", branch]);
        std::fs::write(self.path.join(filename), content).expect("Failed to write file");
        self.git(&["add", filename]);
        self.git(&["commit", "-q", "-m", &format!("{} on {}", filename, branch)]);
        let head = self.git(&["rev-parse", "HEAD"]);
        self.git(&["checkout", "-q", "main"]);
        head
    }

    /// Content of `filename` at the tip of `branch`, if present.
    pub fn show(&self, branch: &str, filename: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", branch, filename)])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git show");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn tip(&self, branch: &str) -> String {
        self.git(&["rev-parse", branch])
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        !self.git(&["branch", "--list", name]).is_empty()
    }

    pub fn git_ops(&self) -> arbor::Result<GitOps> {
        GitOps::new(&self.path)
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// An orchestrator over a real repository and an in-memory store, with the
/// notification sink captured.
pub struct TreeHarness {
    pub repo: TestRepo,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub events: Receiver<TreeEvent>,
}

impl TreeHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_ledger(config, Arc::new(UnlimitedLedger))
    }

    pub fn with_ledger(config: Config, ledger: Arc<dyn CreditLedger>) -> Self {
        let repo = TestRepo::new();
        let store = Arc::new(MemoryStore::new());
        let (tx, events) = crossbeam_channel::unbounded();
        let orchestrator = Orchestrator::builder()
            .config(config)
            .store(store.clone())
            .vcs(Arc::new(repo.git_ops().expect("Failed to open repo")))
            .ledger(ledger)
            .sink(tx)
            .build()
            .expect("Failed to build orchestrator");
        Self {
            repo,
            orchestrator: Arc::new(orchestrator),
            store,
            events,
        }
    }

    /// Running root in EXPLORE, branched from `main`.
    pub async fn root(&self) -> AgentNode {
        self.orchestrator
            .spawn_root("build the app", "user-1", "main", Specialization::General, None)
            .await
            .expect("Failed to spawn root")
    }

    /// Running root already in SUMMON.
    pub async fn root_in_summon(&self) -> AgentNode {
        let root = self.root().await;
        self.advance(root.id, &[Phase::Plan, Phase::Found, Phase::Summon], 1).await;
        self.node(root.id)
    }

    pub async fn spawn(&self, parent: NodeId, specialization: Specialization) -> SpawnOutcome {
        self.orchestrator
            .spawn_child(parent, specialization, &format!("{} work", specialization))
            .await
            .expect("spawn_child failed")
    }

    pub async fn spawn_now(&self, parent: NodeId, specialization: Specialization) -> AgentNode {
        self.spawn(parent, specialization)
            .await
            .spawned()
            .expect("expected an immediate spawn")
    }

    /// Advance through `phases` in order using seqs starting at `first_seq`.
    pub async fn advance(&self, node: NodeId, phases: &[Phase], first_seq: u64) {
        for (i, to) in phases.iter().enumerate() {
            let from = self.node(node).phase;
            self.orchestrator
                .advance(node, *to, report_for(from), first_seq + i as u64)
                .await
                .unwrap_or_else(|e| panic!("advance {} -> {} failed: {}", from, to, e));
        }
    }

    /// Take a child from EXPLORE through COMPLETE and complete it.
    pub async fn finish_child(&self, node: NodeId) -> arbor::orchestration::Completion {
        self.advance(node, &[Phase::Plan, Phase::Summon, Phase::Complete], 1).await;
        self.orchestrator
            .complete(node, CompletionReport::new("done"), 100)
            .await
            .expect("complete failed")
            .applied()
            .expect("first completion must apply")
    }

    pub fn node(&self, id: NodeId) -> AgentNode {
        self.store.read_node(id).expect("node missing")
    }

    pub fn store_children(&self, id: NodeId) -> Vec<AgentNode> {
        self.store.children(id).expect("children missing")
    }

    pub fn drain_events(&self) -> Vec<TreeEvent> {
        self.events.try_iter().collect()
    }
}

/// The report a node must hand in when leaving `phase`.
pub fn report_for(phase: Phase) -> PhaseReport {
    match phase {
        Phase::Explore => PhaseReport::Explore(ExploreReport {
            summary: "explored the codebase".to_string(),
            confidence: 0.8,
            findings: vec!["uses axum".to_string()],
            relevant_paths: vec!["src/".to_string()],
        }),
        Phase::Plan => PhaseReport::Plan(PlanReport {
            summary: "split into backend and frontend".to_string(),
            confidence: 0.75,
            steps: vec!["backend".to_string(), "frontend".to_string()],
            planned_children: vec![Specialization::Backend, Specialization::Frontend],
        }),
        Phase::Found => PhaseReport::Foundation(FoundationReport {
            summary: "shared types in place".to_string(),
            confidence: 0.9,
            commit: None,
            shared_artifacts: vec!["src/types.rs".to_string()],
        }),
        Phase::Summon | Phase::Complete => PhaseReport::Summon(SummonReport {
            summary: "children finished".to_string(),
            confidence: 0.9,
            children_spawned: 2,
        }),
    }
}
