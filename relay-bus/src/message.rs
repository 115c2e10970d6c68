//! Relay outputs

use reduction_core::{AccountId, Amount, Command};
use serde::{Deserialize, Serialize};

/// What a relay derives from one published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Deliver a command to an entity
    Command(Command),
    /// Report a terminal result to subscribers
    Notify(Outcome),
}

/// Terminal results visible to the upstream trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// Every cent of the withdrawal is held
    WithdrawalApproved {
        /// Owning account
        account: AccountId,
        /// Withdrawal (root) id
        withdrawal: String,
        /// Withdrawn amount
        amount: Amount,
    },
    /// Withdrawal could not be funded; every hold was released
    WithdrawalCanceled {
        /// Owning account
        account: AccountId,
        /// Withdrawal (root) id
        withdrawal: String,
    },
    /// Root of the balance tree released a new aggregate
    BalanceUpdated {
        /// Owning account
        account: AccountId,
        /// Account balance
        balance: Amount,
    },
}

impl Outcome {
    /// Account the outcome belongs to
    pub fn account(&self) -> &AccountId {
        match self {
            Outcome::WithdrawalApproved { account, .. }
            | Outcome::WithdrawalCanceled { account, .. }
            | Outcome::BalanceUpdated { account, .. } => account,
        }
    }

    /// Withdrawal id for withdrawal outcomes
    pub fn withdrawal(&self) -> Option<&str> {
        match self {
            Outcome::WithdrawalApproved { withdrawal, .. }
            | Outcome::WithdrawalCanceled { withdrawal, .. } => Some(withdrawal),
            Outcome::BalanceUpdated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_json_shape() {
        let outcome = Outcome::WithdrawalApproved {
            account: AccountId::new("acct"),
            withdrawal: "wd1".to_string(),
            amount: Amount::from_cents(6_000),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["type"], "withdrawal_approved");
        assert_eq!(outcome.withdrawal(), Some("wd1"));
        assert_eq!(outcome.account().as_str(), "acct");
    }
}
