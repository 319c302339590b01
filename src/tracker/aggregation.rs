use crate::models::{Amount, EntryState, QueryResult};

/// Totals over one batch of query results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateTotals {
    /// Sum of every Ready value
    pub total: Amount,
    pub ready: usize,
    pub loading: usize,
    pub errored: usize,
}

impl AggregateTotals {
    /// Whether every entry contributed to the total
    pub fn is_complete(&self) -> bool {
        self.loading == 0 && self.errored == 0
    }
}

/// Sum the Ready values of `results`.
///
/// Loading, Idle and Errored entries add zero, so the total is always a
/// best-effort figure over whatever has arrived so far.
pub fn total(results: &[QueryResult]) -> Amount {
    results
        .iter()
        .filter_map(QueryResult::ready_value)
        .fold(Amount::ZERO, |acc, value| acc.saturating_add(value))
}

/// Same as [`total`], with a breakdown of how many entries were counted
pub fn summarize(results: &[QueryResult]) -> AggregateTotals {
    results
        .iter()
        .fold(AggregateTotals::default(), |mut acc, result| {
            match result.state {
                EntryState::Ready => {
                    acc.ready += 1;
                    if let Some(value) = result.data {
                        acc.total = acc.total.saturating_add(value);
                    }
                }
                EntryState::Errored => acc.errored += 1,
                EntryState::Loading | EntryState::Idle => acc.loading += 1,
            }
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use crate::models::Address;

    fn result(byte: u8, state: EntryState, data: Option<u64>) -> QueryResult {
        QueryResult {
            address: Address::from([byte; 20]),
            state,
            is_loading: state == EntryState::Loading,
            data: data.map(Amount::from),
            error: (state == EntryState::Errored)
                .then(|| TrackerError::TransientFetch("down".to_string())),
        }
    }

    #[test]
    fn test_total_counts_only_ready_entries() {
        let results = vec![
            result(1, EntryState::Ready, Some(100)),
            result(2, EntryState::Ready, Some(0)),
            result(3, EntryState::Loading, None),
            // Errored entries keep their old value but it is not counted.
            result(4, EntryState::Errored, Some(50)),
            result(5, EntryState::Idle, Some(7)),
        ];

        assert_eq!(total(&results), Amount::from(100u64));

        let summary = summarize(&results);
        assert_eq!(summary.total, Amount::from(100u64));
        assert_eq!(summary.ready, 2);
        assert_eq!(summary.loading, 2);
        assert_eq!(summary.errored, 1);
        assert!(!summary.is_complete());
    }

    #[test]
    fn test_total_of_empty_batch_is_zero() {
        assert_eq!(total(&[]), Amount::ZERO);
        assert!(summarize(&[]).is_complete());
    }

    #[test]
    fn test_total_handles_large_amounts() {
        let big = Amount::from(10u64).pow(Amount::from(30u64));
        let mut a = result(1, EntryState::Ready, None);
        a.data = Some(big);
        let mut b = result(2, EntryState::Ready, None);
        b.data = Some(big);

        assert_eq!(total(&[a, b]), big * Amount::from(2u64));
    }
}
