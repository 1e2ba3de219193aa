//! Staking automation: keeps operator addresses at their target roll counts.

mod manager;
pub mod rebalance;

pub use manager::{StakingManager, NODE_DOWN_SUBSCRIBER, STATUS_ON_SUBSCRIBER};
pub use rebalance::{plan_rebalance, RollAction};

use serde::Serialize;

use crate::node_api::{DeferredCredit, NodeAddress};

/// Target meaning "buy as many rolls as the balance allows".
pub const AUTO_COMPOUND: i64 = -1;

/// A submitted roll operation that has not reached finality yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub id: String,
    /// Candidate roll count once the operation lands.
    pub expected_rolls: u64,
    /// Last period the operation can be included in, once the node has reported it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_period: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StakingAddress {
    pub address: String,
    pub thread: u8,
    pub final_rolls: u64,
    pub candidate_rolls: u64,
    pub active_rolls: u64,
    pub final_balance: f64,
    pub candidate_balance: f64,
    pub deferred_credits: Vec<DeferredCredit>,
    pub target_rolls: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_operation: Option<PendingOperation>,
}

impl StakingAddress {
    pub fn from_node(info: NodeAddress, active_rolls: u64, target_rolls: i64) -> Self {
        Self {
            address: info.address,
            thread: info.thread,
            final_rolls: info.final_roll_count,
            candidate_rolls: info.candidate_roll_count,
            active_rolls,
            final_balance: info.final_balance,
            candidate_balance: info.candidate_balance,
            deferred_credits: info.deferred_credits,
            target_rolls,
            pending_operation: None,
        }
    }

    /// Copy the on-chain view from `fresh`, keeping target and pending operation.
    /// Returns true when anything changed.
    pub fn refresh_from(&mut self, fresh: &StakingAddress) -> bool {
        let changed = self.thread != fresh.thread
            || self.final_rolls != fresh.final_rolls
            || self.candidate_rolls != fresh.candidate_rolls
            || self.active_rolls != fresh.active_rolls
            || self.final_balance != fresh.final_balance
            || self.candidate_balance != fresh.candidate_balance
            || self.deferred_credits != fresh.deferred_credits;
        if changed {
            self.thread = fresh.thread;
            self.final_rolls = fresh.final_rolls;
            self.candidate_rolls = fresh.candidate_rolls;
            self.active_rolls = fresh.active_rolls;
            self.final_balance = fresh.final_balance;
            self.candidate_balance = fresh.candidate_balance;
            self.deferred_credits = fresh.deferred_credits.clone();
        }
        changed
    }

    /// Balance plus final rolls plus deferred credits, in coins.
    pub fn value(&self, roll_price: f64) -> f64 {
        let deferred: f64 = self.deferred_credits.iter().map(|c| c.amount).sum();
        self.final_balance + self.final_rolls as f64 * roll_price + deferred
    }
}

/// Network-wide constants read once per node session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Miscellaneous {
    pub minimal_fees: f64,
    pub roll_price: f64,
}

/// Sum of every address's value, floored to 3 decimals.
pub fn total_value(addresses: &[StakingAddress], roll_price: f64) -> f64 {
    let total: f64 = addresses.iter().map(|a| a.value(roll_price)).sum();
    (total * 1000.0).floor() / 1000.0
}

#[cfg(test)]
pub(crate) fn test_address(address: &str, final_balance: f64, final_rolls: u64) -> StakingAddress {
    StakingAddress {
        address: address.to_string(),
        thread: 0,
        final_rolls,
        candidate_rolls: final_rolls,
        active_rolls: final_rolls,
        final_balance,
        candidate_balance: final_balance,
        deferred_credits: Vec::new(),
        target_rolls: AUTO_COMPOUND,
        pending_operation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_api::Slot;

    #[test]
    fn test_total_value() {
        let addresses = vec![test_address("AU1", 500.0, 0), test_address("AU2", 0.0, 5)];
        assert_eq!(total_value(&addresses, 100.0), 1000.0);
    }

    #[test]
    fn test_total_value_includes_deferred_and_floors() {
        let mut addr = test_address("AU1", 10.12345, 1);
        addr.deferred_credits.push(DeferredCredit {
            slot: Slot {
                period: 5,
                thread: 0,
            },
            amount: 0.0009,
        });
        assert_eq!(total_value(&[addr], 100.0), 110.124);
    }

    #[test]
    fn test_refresh_keeps_target_and_pending() {
        let mut tracked = test_address("AU1", 100.0, 1);
        tracked.target_rolls = 4;
        tracked.pending_operation = Some(PendingOperation {
            id: "O1".into(),
            expected_rolls: 2,
            expire_period: None,
        });

        let mut fresh = test_address("AU1", 0.0, 2);
        fresh.active_rolls = 1;
        assert!(tracked.refresh_from(&fresh));
        assert_eq!(tracked.final_rolls, 2);
        assert_eq!(tracked.active_rolls, 1);
        assert_eq!(tracked.target_rolls, 4);
        assert!(tracked.pending_operation.is_some());

        assert!(!tracked.refresh_from(&fresh));
    }
}
