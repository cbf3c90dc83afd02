use crate::cancel::CancelToken;
use crate::error::{FetchError, FetchResult};

pub const DEFAULT_PORTIONS: [usize; 6] = [50, 30, 20, 10, 5, 1];
/// Budget for the URL-encoded, `|`-joined title list of one request.
pub const MAX_ENCODED_TITLES_LEN: usize = 8000;

/// Adaptive batching around a single remote operation.
///
/// Every call walks the title list with a cursor, trying candidate batch sizes
/// from largest to smallest. Over-long batches and `SizeExceeded` answers shrink
/// the batch; a single title that still does not fit is skipped.
#[derive(Debug, Clone)]
pub struct BatchFetcher {
    portions: Vec<usize>,
    cancel: CancelToken,
}

impl BatchFetcher {
    pub fn new(portions: &[usize], cancel: CancelToken) -> Self {
        Self {
            portions: normalize_portions(portions),
            cancel,
        }
    }

    pub fn portions(&self) -> &[usize] {
        &self.portions
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `call` over `titles` in adaptive sub-batches and collects one output
    /// per successful sub-batch, in cursor order.
    pub fn fetch<R, F>(
        &self,
        code: &str,
        operation: &str,
        titles: &[String],
        mut call: F,
    ) -> FetchResult<Vec<R>>
    where
        F: FnMut(&[String]) -> FetchResult<R>,
    {
        let mut outputs = Vec::new();
        let mut cursor = 0usize;

        while cursor < titles.len() {
            self.cancel.check()?;
            let remaining = titles.len() - cursor;
            let mut candidates: Vec<usize> = self
                .portions
                .iter()
                .map(|portion| (*portion).min(remaining))
                .collect();
            candidates.dedup();

            for (index, &size) in candidates.iter().enumerate() {
                let batch = &titles[cursor..cursor + size];
                let is_last_candidate = index + 1 == candidates.len();

                if encoded_titles_len(batch) > MAX_ENCODED_TITLES_LEN {
                    if is_last_candidate {
                        tracing::warn!(code, operation, title = %batch[0], "title exceeds request size budget, skipping");
                        cursor += 1;
                    }
                    continue;
                }

                tracing::debug!(code, operation, size, "fetching sub-batch");
                match call(batch) {
                    Ok(output) => {
                        outputs.push(output);
                        cursor += size;
                        break;
                    }
                    Err(FetchError::SizeExceeded) if is_last_candidate => {
                        tracing::warn!(code, operation, title = %batch[0], "remote rejected single title as too large, skipping");
                        cursor += 1;
                    }
                    Err(FetchError::SizeExceeded) => {
                        tracing::debug!(code, operation, size, "remote size limit hit, shrinking batch");
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        Ok(outputs)
    }
}

impl Default for BatchFetcher {
    fn default() -> Self {
        Self::new(&DEFAULT_PORTIONS, CancelToken::new())
    }
}

/// Sorts descending, drops zeros and duplicates, and ensures the list ends in 1.
pub fn normalize_portions(portions: &[usize]) -> Vec<usize> {
    let mut out: Vec<usize> = portions.iter().copied().filter(|size| *size > 0).collect();
    out.sort_unstable_by(|left, right| right.cmp(left));
    out.dedup();
    if out.is_empty() {
        return DEFAULT_PORTIONS.to_vec();
    }
    if out.last() != Some(&1) {
        out.push(1);
    }
    out
}

/// Length of the titles once `|`-joined and percent-encoded as a query value.
pub fn encoded_titles_len(titles: &[String]) -> usize {
    let separators = titles.len().saturating_sub(1) * 3;
    separators
        + titles
            .iter()
            .map(|title| {
                title
                    .bytes()
                    .map(|byte| match byte {
                        b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b' ' => 1,
                        _ => 3,
                    })
                    .sum::<usize>()
            })
            .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{BatchFetcher, DEFAULT_PORTIONS, encoded_titles_len, normalize_portions};
    use crate::cancel::CancelToken;
    use crate::error::FetchError;

    fn titles(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("Title {index}")).collect()
    }

    #[test]
    fn uses_largest_fitting_portion_then_restarts() {
        let fetcher = BatchFetcher::default();
        let mut sizes = Vec::new();
        let outputs = fetcher
            .fetch("en", "resolve", &titles(73), |batch| {
                sizes.push(batch.len());
                Ok(batch.len())
            })
            .expect("fetch");
        assert_eq!(sizes, vec![50, 23]);
        assert_eq!(outputs.iter().sum::<usize>(), 73);
    }

    #[test]
    fn size_exceeded_shrinks_to_next_candidate() {
        let fetcher = BatchFetcher::default();
        let mut sizes = Vec::new();
        fetcher
            .fetch("en", "langlinks", &titles(40), |batch| {
                sizes.push(batch.len());
                if batch.len() > 20 {
                    Err(FetchError::SizeExceeded)
                } else {
                    Ok(())
                }
            })
            .expect("fetch");
        assert_eq!(sizes, vec![40, 30, 20, 20]);
    }

    #[test]
    fn long_titles_are_split_by_url_budget() {
        let fetcher = BatchFetcher::default();
        let long = vec!["x".repeat(3000); 6];
        let mut sizes = Vec::new();
        fetcher
            .fetch("en", "resolve", &long, |batch| {
                sizes.push(batch.len());
                Ok(())
            })
            .expect("fetch");
        assert!(sizes.iter().all(|size| *size <= 2));
        assert_eq!(sizes.iter().sum::<usize>(), 6);
    }

    #[test]
    fn oversized_single_title_is_skipped() {
        let fetcher = BatchFetcher::default();
        let input = vec!["y".repeat(9000), "Dog".to_string()];
        let mut seen = Vec::new();
        fetcher
            .fetch("en", "resolve", &input, |batch| {
                seen.extend(batch.iter().cloned());
                Ok(())
            })
            .expect("fetch");
        assert_eq!(seen, vec!["Dog".to_string()]);
    }

    #[test]
    fn fatal_errors_propagate() {
        let fetcher = BatchFetcher::default();
        let error = fetcher
            .fetch("en", "resolve", &titles(3), |_| -> Result<(), FetchError> {
                Err(FetchError::api("badvalue", "Unrecognized value"))
            })
            .expect_err("must fail");
        assert_eq!(error, FetchError::api("badvalue", "Unrecognized value"));
    }

    #[test]
    fn cancelled_fetch_stops_before_next_sub_batch() {
        let token = CancelToken::new();
        let fetcher = BatchFetcher::new(&[1], token.clone());
        let mut calls = 0;
        let error = fetcher
            .fetch("en", "resolve", &titles(3), |_| {
                calls += 1;
                token.cancel();
                Ok(())
            })
            .expect_err("cancelled");
        assert_eq!(error, FetchError::Cancelled);
        assert_eq!(calls, 1);
    }

    #[test]
    fn portions_are_normalized() {
        assert_eq!(normalize_portions(&[5, 50, 5, 0, 20]), vec![50, 20, 5, 1]);
        assert_eq!(normalize_portions(&[]), DEFAULT_PORTIONS.to_vec());
    }

    #[test]
    fn encoded_length_counts_separators_and_escapes() {
        assert_eq!(encoded_titles_len(&["Dog".to_string()]), 3);
        assert_eq!(encoded_titles_len(&["A".to_string(), "B".to_string()]), 5);
        assert_eq!(encoded_titles_len(&["é".to_string()]), 6);
    }

    proptest! {
        #[test]
        fn degrades_to_single_titles_and_terminates(count in 0usize..120) {
            let fetcher = BatchFetcher::default();
            let input = titles(count);
            let mut seen = Vec::new();
            fetcher
                .fetch("en", "resolve", &input, |batch| {
                    if batch.len() > 1 {
                        return Err(FetchError::SizeExceeded);
                    }
                    seen.push(batch[0].clone());
                    Ok(())
                })
                .expect("fetch");
            prop_assert_eq!(seen, input);
        }
    }
}
