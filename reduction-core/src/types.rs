//! Core types shared by every entity
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, two fractional digits)
//! - Deterministic composite ids any caller can derive without a lookup

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

use crate::{Error, Result};

/// Separator joining the components of a composite entity id
pub const ID_SEPARATOR: char = '_';

/// Separator between path segments inside one id component (`0.3.7`)
pub const PATH_SEPARATOR: char = '.';

/// Fixed-point money amount with exactly two fractional digits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    /// Zero
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Largest magnitude accepted from callers, in cents
    pub const MAX_CENTS: i64 = 1_000_000_000_000_000;

    /// Wrap a decimal, rejecting sub-cent precision and out-of-range magnitudes
    pub fn new(value: Decimal) -> Result<Self> {
        let normalized = value.normalize();
        if normalized.scale() > 2 {
            return Err(Error::InvalidCommand(format!(
                "amount {} has more than two fractional digits",
                value
            )));
        }
        if normalized.abs() > Decimal::new(Self::MAX_CENTS, 2) {
            return Err(Error::InvalidCommand(format!(
                "amount {} exceeds {}",
                value,
                Decimal::new(Self::MAX_CENTS, 2)
            )));
        }
        Ok(Self(normalized))
    }

    /// Build from a whole number of cents
    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, 2))
    }

    /// Amount expressed in cents; sums past `i64` are an error, never a wrap
    pub fn cents(&self) -> Result<i64> {
        let mut value = self.0;
        value.rescale(2);
        i64::try_from(value.mantissa())
            .map_err(|_| Error::InvalidCommand(format!("amount {} out of range", self)))
    }

    /// Underlying decimal
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Strictly less than zero
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// Reject anything that is not strictly positive
    pub fn ensure_positive(self, what: &str) -> Result<Self> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(Error::InvalidCommand(format!(
                "{} must be positive, got {}",
                what, self
            )))
        }
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = Error;

    fn try_from(value: Decimal) -> Result<Self> {
        Amount::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Decimal {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0;
        value.rescale(2);
        write!(f, "{}", value)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| Error::InvalidCommand(format!("invalid amount {:?}: {}", s, e)))?;
        Amount::new(value)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.copied().sum()
    }
}

fn validate_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidId(format!("{} must not be empty", kind)));
    }
    if value.contains(ID_SEPARATOR) {
        return Err(Error::InvalidId(format!(
            "{} {:?} must not contain '{}'",
            kind, value, ID_SEPARATOR
        )));
    }
    Ok(())
}

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the id can be embedded in a composite id
    pub fn validate(&self) -> Result<()> {
        validate_component("account id", &self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root of one distribution tree (one withdrawal of one account)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RootId {
    account: AccountId,
    root: String,
}

impl RootId {
    /// Create a validated root id
    pub fn new(account: AccountId, root: impl Into<String>) -> Result<Self> {
        let root = root.into();
        account.validate()?;
        validate_component("root id", &root)?;
        Ok(Self { account, root })
    }

    /// Owning account
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Root component (the withdrawal id)
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Trunk node of this tree
    pub fn trunk(&self) -> TreeId {
        TreeId {
            root: self.clone(),
            node: "0".to_string(),
        }
    }

    /// `account_root`
    pub fn entity_id(&self) -> String {
        format!("{}{}{}", self.account, ID_SEPARATOR, self.root)
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_id())
    }
}

/// Position of a node or leaf inside a distribution tree: (root-id, node path)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId {
    root: RootId,
    node: String,
}

impl TreeId {
    /// Trunk of the given tree
    pub fn trunk(root: &RootId) -> Self {
        root.trunk()
    }

    /// Tree this node belongs to
    pub fn root(&self) -> &RootId {
        &self.root
    }

    /// Owning account
    pub fn account(&self) -> &AccountId {
        self.root.account()
    }

    /// Node path (`0`, `0.3`, `0.3.7`)
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Whether this is the trunk position
    pub fn is_trunk(&self) -> bool {
        !self.node.contains(PATH_SEPARATOR)
    }

    /// Depth below the trunk
    pub fn depth(&self) -> usize {
        self.node.matches(PATH_SEPARATOR).count()
    }

    /// Deterministic id of the `index`-th child (1-based)
    pub fn child(&self, index: usize) -> TreeId {
        TreeId {
            root: self.root.clone(),
            node: format!("{}{}{}", self.node, PATH_SEPARATOR, index),
        }
    }

    /// `account_root_node`
    pub fn entity_id(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.root.account, ID_SEPARATOR, self.root.root, ID_SEPARATOR, self.node
        )
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_id())
    }
}

/// Identifier of one capacity-bounded deposit shard
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    account: AccountId,
    deposit: String,
    unit: String,
}

impl ShardId {
    /// Root shard of a deposit
    pub fn new(account: AccountId, deposit: impl Into<String>) -> Result<Self> {
        let deposit = deposit.into();
        account.validate()?;
        validate_component("deposit id", &deposit)?;
        Ok(Self {
            account,
            deposit,
            unit: "0".to_string(),
        })
    }

    /// Owning account
    pub fn owner(&self) -> &AccountId {
        &self.account
    }

    /// Deposit this shard was split from
    pub fn deposit(&self) -> &str {
        &self.deposit
    }

    /// Unit path inside the deposit
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Whether this is the shard a deposit first lands on
    pub fn is_root(&self) -> bool {
        !self.unit.contains(PATH_SEPARATOR)
    }

    /// Deterministic id of the `index`-th child shard (1-based)
    pub fn child(&self, index: usize) -> ShardId {
        ShardId {
            account: self.account.clone(),
            deposit: self.deposit.clone(),
            unit: format!("{}{}{}", self.unit, PATH_SEPARATOR, index),
        }
    }

    /// `account_deposit_unit`
    pub fn entity_id(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.account, ID_SEPARATOR, self.deposit, ID_SEPARATOR, self.unit
        )
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_id())
    }
}

/// Node of the balance aggregation tree: (account, level, branch)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId {
    account: AccountId,
    level: u32,
    branch: u64,
}

impl BranchId {
    /// Create a balance tree position
    pub fn new(account: AccountId, level: u32, branch: u64) -> Self {
        Self {
            account,
            level,
            branch,
        }
    }

    /// Root (level 0) of an account's balance tree
    pub fn root(account: AccountId) -> Self {
        Self::new(account, 0, 0)
    }

    /// Owning account
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Level (0 is the root)
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Branch number within the level
    pub fn branch(&self) -> u64 {
        self.branch
    }

    /// Whether this is the root of the balance tree
    pub fn is_root(&self) -> bool {
        self.level == 0
    }

    /// `account_level_branch`
    pub fn entity_id(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.account, ID_SEPARATOR, self.level, ID_SEPARATOR, self.branch
        )
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_parse_and_display() {
        let amount: Amount = "123.45".parse().unwrap();
        assert_eq!(amount.cents().unwrap(), 12345);
        assert_eq!(amount.to_string(), "123.45");

        let whole: Amount = "25".parse().unwrap();
        assert_eq!(whole.to_string(), "25.00");
        assert_eq!(whole, Amount::from_cents(2500));
    }

    #[test]
    fn test_amount_rejects_sub_cent() {
        assert!("1.005".parse::<Amount>().is_err());
        // trailing zeros are not extra precision
        assert_eq!("1.500".parse::<Amount>().unwrap(), Amount::from_cents(150));
    }

    #[test]
    fn test_amount_rejects_out_of_range() {
        assert!("10000000000000.00".parse::<Amount>().is_ok());
        assert!("10000000000000.01".parse::<Amount>().is_err());
        assert!("-99999999999999999999".parse::<Amount>().is_err());
        // serde goes through the same check
        let bytes = bincode::serialize(&Decimal::new(i64::MAX, 0)).unwrap();
        assert!(bincode::deserialize::<Amount>(&bytes).is_err());

        // sums can still leave i64 cents; reported, not wrapped
        let huge = Amount::from_cents(i64::MAX) + Amount::from_cents(i64::MAX);
        assert!(huge.cents().is_err());
    }

    #[test]
    fn test_amount_exact_arithmetic() {
        let needed = Amount::from_cents(494);
        let funded = Amount::from_cents(493);
        assert!(funded < needed);
        assert_eq!(needed - funded, Amount::from_cents(1));

        let total: Amount = [Amount::from_cents(10), Amount::from_cents(20)].iter().sum();
        assert_eq!(total, Amount::from_cents(30));
        assert!((-total).is_negative());
    }

    #[test]
    fn test_ensure_positive() {
        assert!(Amount::ZERO.ensure_positive("amount").is_err());
        assert!(Amount::from_cents(-1).ensure_positive("amount").is_err());
        assert!(Amount::from_cents(1).ensure_positive("amount").is_ok());
    }

    #[test]
    fn test_tree_ids_are_deterministic() {
        let root = RootId::new(AccountId::new("acct"), "wd1").unwrap();
        let trunk = root.trunk();
        assert!(trunk.is_trunk());
        assert_eq!(trunk.entity_id(), "acct_wd1_0");

        let grandchild = trunk.child(3).child(7);
        assert_eq!(grandchild.entity_id(), "acct_wd1_0.3.7");
        assert_eq!(grandchild.depth(), 2);
        assert!(!grandchild.is_trunk());
        assert_eq!(trunk.child(3).child(7), grandchild);
    }

    #[test]
    fn test_ids_reject_separator() {
        assert!(RootId::new(AccountId::new("a_b"), "wd").is_err());
        assert!(RootId::new(AccountId::new("acct"), "").is_err());
        assert!(ShardId::new(AccountId::new("acct"), "dep_1").is_err());
    }

    #[test]
    fn test_shard_and_branch_ids() {
        let shard = ShardId::new(AccountId::new("acct"), "dep1").unwrap();
        assert_eq!(shard.entity_id(), "acct_dep1_0");
        assert_eq!(shard.child(2).entity_id(), "acct_dep1_0.2");
        assert!(shard.is_root());
        assert!(!shard.child(2).is_root());

        let branch = BranchId::new(AccountId::new("acct"), 2, 417);
        assert_eq!(branch.entity_id(), "acct_2_417");
        assert!(BranchId::root(AccountId::new("acct")).is_root());
    }
}
