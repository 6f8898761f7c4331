//! Credit ledger contract. Only debit/deny is consumed here; account
//! bookkeeping belongs to the ledger itself.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::tree::{Cost, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDenial {
    pub reason: String,
}

impl LedgerDenial {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub trait CreditLedger: Send + Sync {
    fn debit(&self, user: &str, amount: Cost, node: NodeId) -> Result<(), LedgerDenial>;
}

/// Accepts every debit.
pub struct UnlimitedLedger;

impl CreditLedger for UnlimitedLedger {
    fn debit(&self, _user: &str, _amount: Cost, _node: NodeId) -> Result<(), LedgerDenial> {
        Ok(())
    }
}

/// Fixed balance per user; a debit that would go below zero is denied and
/// leaves the balance untouched.
#[derive(Default)]
pub struct BudgetLedger {
    balances: Mutex<HashMap<String, Cost>>,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(self, user: &str, amount: Cost) -> Self {
        if let Ok(mut balances) = self.balances.lock() {
            balances.insert(user.to_string(), amount);
        }
        self
    }

    pub fn balance(&self, user: &str) -> Option<Cost> {
        self.balances.lock().ok()?.get(user).copied()
    }
}

impl CreditLedger for BudgetLedger {
    fn debit(&self, user: &str, amount: Cost, _node: NodeId) -> Result<(), LedgerDenial> {
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| LedgerDenial::new("ledger unavailable"))?;
        let balance = balances
            .get_mut(user)
            .ok_or_else(|| LedgerDenial::new(format!("no credit account for {}", user)))?;
        match balance.checked_sub(amount) {
            Some(remaining) => {
                *balance = remaining;
                Ok(())
            }
            None => Err(LedgerDenial::new(format!(
                "insufficient credit: balance {} < {}",
                balance, amount
            ))),
        }
    }
}
