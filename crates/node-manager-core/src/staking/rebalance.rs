//! Roll rebalancing policy.
//!
//! Targets are compared against candidate rolls, which already include
//! operations that have been accepted but not finalized.

use super::{Miscellaneous, StakingAddress};
use crate::error::{NodeManagerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollAction {
    Hold,
    Buy(u64),
    Sell(u64),
}

impl RollAction {
    /// Candidate roll count once the action lands.
    pub fn expected_rolls(&self, candidate_rolls: u64) -> u64 {
        match *self {
            RollAction::Hold => candidate_rolls,
            RollAction::Buy(n) => candidate_rolls + n,
            RollAction::Sell(n) => candidate_rolls.saturating_sub(n),
        }
    }
}

/// Decide what to do for one address. Does not look at pending operations;
/// callers must resolve those first.
pub fn plan_rebalance(addr: &StakingAddress, misc: &Miscellaneous) -> Result<RollAction> {
    if misc.roll_price <= 0.0 {
        return Err(NodeManagerError::Rpc("roll price is not known".into()));
    }

    let max_buyable = (addr.final_balance.max(0.0) / misc.roll_price).floor() as u64;
    let candidate = addr.candidate_rolls;

    let action = if addr.target_rolls < 0 {
        if max_buyable == 0 {
            RollAction::Hold
        } else {
            RollAction::Buy(max_buyable)
        }
    } else {
        let target = addr.target_rolls as u64;
        if target < candidate {
            RollAction::Sell(candidate - target)
        } else if target > candidate {
            match (target - candidate).min(max_buyable) {
                0 => RollAction::Hold,
                n => RollAction::Buy(n),
            }
        } else {
            RollAction::Hold
        }
    };

    let verb = match action {
        RollAction::Hold => return Ok(action),
        RollAction::Buy(_) => "buy",
        RollAction::Sell(_) => "sell",
    };
    if addr.final_balance < misc.minimal_fees {
        return Err(NodeManagerError::InsufficientFees {
            address: addr.address.clone(),
            action: verb,
            balance: addr.final_balance,
            fees: misc.minimal_fees,
        });
    }
    Ok(action)
}
