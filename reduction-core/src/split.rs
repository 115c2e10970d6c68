//! Exact split arithmetic
//!
//! Every split works on whole cents so the shares always sum to the total:
//!
//! ```text
//! share_count(T, C) = ceil(Tc / Cc)
//! distribute(T, N)  = N shares of floor(Tc / N) cents,
//!                     the first (Tc mod N) shares carry one extra cent
//! ```

use crate::types::Amount;
use crate::{Error, Result};

/// Number of shares of at most `cap` needed to cover `total`
pub fn share_count(total: Amount, cap: Amount) -> Result<usize> {
    let total = total.ensure_positive("total")?;
    let cap = cap.ensure_positive("cap")?;
    let (tc, cc) = (total.cents()?, cap.cents()?);
    usize::try_from((tc - 1) / cc + 1)
        .map_err(|_| Error::InvalidCommand(format!("{} over {} is too many shares", total, cap)))
}

/// Partition `total` into `n` shares differing by at most one cent
pub fn distribute(total: Amount, n: usize) -> Result<Vec<Amount>> {
    if n == 0 {
        return Err(Error::InvalidCommand("cannot distribute into zero shares".into()));
    }
    if total.is_negative() {
        return Err(Error::InvalidCommand(format!(
            "cannot distribute negative total {}",
            total
        )));
    }

    let tc = total.cents()?;
    let count = n as i64;
    let base = tc / count;
    let remainder = (tc % count) as usize;

    Ok((0..n)
        .map(|i| Amount::from_cents(if i < remainder { base + 1 } else { base }))
        .collect())
}

/// Split into `ceil(total / cap)` shares, each at most `cap`
pub fn split_by_cap(total: Amount, cap: Amount) -> Result<Vec<Amount>> {
    distribute(total, share_count(total, cap)?)
}

/// Split into `min(ceil(total / cap), fan_out)` shares
///
/// With the fan-out bound in effect shares may exceed `cap`; the caller
/// splits those again one level down.
pub fn split_with_fan_out(total: Amount, cap: Amount, fan_out: usize) -> Result<Vec<Amount>> {
    if fan_out == 0 {
        return Err(Error::InvalidCommand("fan-out must be at least 1".into()));
    }
    let n = share_count(total, cap)?.min(fan_out);
    distribute(total, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn test_leaf_cap_split() {
        let shares = split_by_cap(amt("123.45"), amt("25.00")).unwrap();
        assert_eq!(shares.len(), 5);
        assert!(shares.iter().all(|s| *s == amt("24.69")));
    }

    #[test]
    fn test_capacity_split_with_remainder() {
        let shares = split_by_cap(amt("543.21"), amt("25.00")).unwrap();
        assert_eq!(shares.len(), 22);
        assert_eq!(&shares[..3], &[amt("24.70"), amt("24.70"), amt("24.70")]);
        assert!(shares[3..].iter().all(|s| *s == amt("24.69")));
        assert_eq!(shares.iter().sum::<Amount>(), amt("543.21"));
    }

    #[test]
    fn test_within_cap_is_single_share() {
        assert_eq!(split_by_cap(amt("25.00"), amt("25.00")).unwrap(), vec![amt("25.00")]);
        assert_eq!(split_by_cap(amt("0.01"), amt("25.00")).unwrap(), vec![amt("0.01")]);
    }

    #[test]
    fn test_fan_out_bound() {
        let shares = split_with_fan_out(amt("10000.00"), amt("25.00"), 25).unwrap();
        assert_eq!(shares.len(), 25);
        assert!(shares.iter().all(|s| *s == amt("400.00")));
    }

    #[test]
    fn test_rejects_degenerate_input() {
        assert!(share_count(Amount::ZERO, amt("25.00")).is_err());
        assert!(share_count(amt("1.00"), Amount::ZERO).is_err());
        assert!(distribute(amt("1.00"), 0).is_err());
        assert!(split_with_fan_out(amt("1.00"), amt("1.00"), 0).is_err());
    }

    #[test]
    fn test_share_count_at_the_edge_of_cents() {
        let max = Amount::from_cents(i64::MAX);
        assert_eq!(share_count(max, Amount::from_cents(1)).unwrap() as u64, i64::MAX as u64);
        assert_eq!(share_count(max, max).unwrap(), 1);
        assert!(share_count(max + max, amt("25.00")).is_err());
    }

    #[test]
    fn test_distribute_more_shares_than_cents() {
        let shares = distribute(amt("0.02"), 3).unwrap();
        assert_eq!(shares, vec![amt("0.01"), amt("0.01"), Amount::ZERO]);
    }
}
