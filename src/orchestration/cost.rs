//! Usage accounting: local totals plus the subtree rollup kept on every
//! ancestor, and the debit against the credit ledger.

use std::sync::Arc;

use crate::config::LedgerPolicy;
use crate::store::WriteBatch;
use crate::tree::{AgentNode, CoordinationEvent, CoordinationKind, Cost, NodeId};
use crate::{alog_debug, alog_warn, Error, Result};

use super::context::{Delivery, TreeContext};
use super::ledger::{CreditLedger, LedgerDenial};
use super::propagator::ExecutionResultPropagator;

/// One usage report from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub tokens: u64,
    pub cost: Cost,
    pub extended_pricing: bool,
}

impl Usage {
    pub fn new(tokens: u64, cost: Cost) -> Self {
        Self {
            tokens,
            cost,
            extended_pricing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageReceipt {
    pub node: AgentNode,
    /// Set when the ledger refused the debit; the usage is recorded anyway.
    pub denial: Option<LedgerDenial>,
}

pub struct CostAggregator {
    ctx: Arc<TreeContext>,
    ledger: Arc<dyn CreditLedger>,
    propagator: Arc<ExecutionResultPropagator>,
}

impl CostAggregator {
    pub fn new(
        ctx: Arc<TreeContext>,
        ledger: Arc<dyn CreditLedger>,
        propagator: Arc<ExecutionResultPropagator>,
    ) -> Self {
        Self {
            ctx,
            ledger,
            propagator,
        }
    }

    /// Add usage to `node_id` and to the subtree totals of every ancestor,
    /// in one batch under the tree lock. The ledger is charged afterwards,
    /// outside the lock.
    ///
    /// Usage arriving after a node terminated is still recorded: the cost
    /// was incurred either way.
    pub async fn record_usage(&self, node_id: NodeId, usage: Usage, seq: u64) -> Result<Delivery<UsageReceipt>> {
        let node = {
            let tree = self.ctx.lock_tree_of(node_id).await?;
            let mut node = self.ctx.store.read_node(node_id)?;
            if !node.accept_usage_seq(seq) {
                alog_warn!("record_usage: duplicate delivery seq={} for node {}", seq, node_id);
                return Ok(Delivery::Duplicate);
            }
            node.tokens_local += usage.tokens;
            node.cost_local += usage.cost;
            node.tokens_subtree += usage.tokens;
            node.cost_subtree += usage.cost;
            if usage.extended_pricing {
                node.extended_pricing_events += 1;
            }

            let mut batch = WriteBatch::new();
            let mut next = node.parent_id;
            while let Some(ancestor_id) = next {
                let mut ancestor = self.ctx.store.read_node(ancestor_id)?;
                ancestor.tokens_subtree += usage.tokens;
                ancestor.cost_subtree += usage.cost;
                next = ancestor.parent_id;
                batch.update(ancestor);
            }
            batch.event(CoordinationEvent::new(
                node_id,
                node.root_id,
                CoordinationKind::UsageRecorded,
                format!(
                    "tokens={} cost={}{}",
                    usage.tokens,
                    usage.cost,
                    if usage.extended_pricing { " extended" } else { "" }
                ),
            ));
            batch.update(node);
            self.ctx.commit(batch)?;
            let node = self.ctx.store.read_node(node_id)?;
            self.ctx.release(tree)?;
            node
        };
        alog_debug!(
            "Recorded usage on {}: tokens={} cost={} subtree={}",
            node_id,
            usage.tokens,
            usage.cost,
            node.cost_subtree
        );

        let denial = if usage.cost > Cost::ZERO {
            self.ledger.debit(&node.owner, usage.cost, node_id).err()
        } else {
            None
        };
        if let Some(ref denial) = denial {
            self.on_denied(&node, usage.cost, denial).await?;
        }
        Ok(Delivery::Applied(UsageReceipt { node, denial }))
    }

    async fn on_denied(&self, node: &AgentNode, amount: Cost, denial: &LedgerDenial) -> Result<()> {
        let err = Error::LedgerDenied {
            node: node.id,
            amount,
            reason: denial.reason.clone(),
        };
        alog_warn!("{}", err);
        let policy = self.ctx.config.ledger_policy;
        {
            let tree = self.ctx.lock_tree_of(node.id).await?;
            let mut batch = WriteBatch::new();
            batch.event(CoordinationEvent::new(
                node.id,
                node.root_id,
                CoordinationKind::LedgerDenied,
                denial.reason.clone(),
            ));
            let mut root = self.ctx.store.read_node(tree.root)?;
            if policy == LedgerPolicy::BlockSpawns && !root.spawns_blocked {
                root.spawns_blocked = true;
                batch.update(root);
                batch.event(CoordinationEvent::new(
                    node.root_id,
                    node.root_id,
                    CoordinationKind::SpawnsBlocked,
                    format!("ledger denied debit for {}", node.owner),
                ));
            }
            self.ctx.commit(batch)?;
        }
        if policy == LedgerPolicy::FailNode {
            self.propagator.fail(node.id, &err.to_string(), None).await?;
        }
        Ok(())
    }

    /// Read of the maintained rollup.
    pub fn get_subtree_cost(&self, node_id: NodeId) -> Result<Cost> {
        Ok(self.ctx.store.read_node(node_id)?.cost_subtree)
    }
}
