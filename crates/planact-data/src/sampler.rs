//! Fixed-length window sampling.

use std::sync::Arc;

use ndarray::Array2;
use planact_core::{PlanActError, Result, Split};
use rand::Rng;

use crate::Corpus;

/// Draws `(batchsize, length)` windows from a corpus split.
///
/// Start offsets are independent and uniform, so windows may repeat across
/// and within calls. The sampler holds no state besides the corpus; callers
/// own the random number generator.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    corpus: Arc<Corpus>,
}

impl BatchSampler {
    /// Create a sampler over a shared corpus.
    pub fn new(corpus: Arc<Corpus>) -> Self {
        Self { corpus }
    }

    /// The underlying corpus.
    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Materialize `batchsize` windows of `length` tokens.
    ///
    /// Offsets are drawn from `[0, n - length - 1)`, which leaves at least one
    /// token after every window. Fails with
    /// [`PlanActError::InsufficientData`] when that range is empty.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        split: Split,
        batchsize: usize,
        length: usize,
    ) -> Result<Array2<u32>> {
        let tokens = self.corpus.tokens(split);
        if length + 1 >= tokens.len() {
            return Err(PlanActError::InsufficientData {
                requested: length,
                available: tokens.len(),
            });
        }
        if batchsize == 0 || length == 0 {
            return Err(PlanActError::InvalidArgument(format!(
                "cannot sample a ({batchsize}, {length}) batch"
            )));
        }

        let upper = tokens.len() - length - 1;
        let mut batch = Array2::zeros((batchsize, length));
        for mut row in batch.rows_mut() {
            let start = rng.gen_range(0..upper);
            for (dst, &src) in row.iter_mut().zip(&tokens[start..start + length]) {
                *dst = src;
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sampler(n: usize) -> BatchSampler {
        let train: Vec<u32> = (0..n as u32).collect();
        let eval: Vec<u32> = (0..n as u32).map(|t| t + 1_000_000).collect();
        BatchSampler::new(Arc::new(Corpus::new(train, eval).unwrap()))
    }

    #[test]
    fn test_windows_are_contiguous() {
        let sampler = sampler(10_000);
        let mut rng = StdRng::seed_from_u64(7);
        let batch = sampler.sample(&mut rng, Split::Train, 4, 32).unwrap();
        assert_eq!(batch.dim(), (4, 32));
        for row in batch.rows() {
            let start = row[0];
            assert!((start as usize) < 10_000 - 32 - 1);
            for (i, &t) in row.iter().enumerate() {
                assert_eq!(t, start + i as u32);
            }
        }
    }

    #[test]
    fn test_eval_split_is_used() {
        let sampler = sampler(100);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = sampler.sample(&mut rng, Split::Eval, 2, 8).unwrap();
        assert!(batch.iter().all(|&t| t >= 1_000_000));
    }

    #[test]
    fn test_window_longer_than_corpus_fails() {
        let sampler = sampler(64);
        let mut rng = StdRng::seed_from_u64(0);
        for length in [63, 64, 100] {
            let err = sampler.sample(&mut rng, Split::Train, 1, length).unwrap_err();
            assert!(matches!(err, PlanActError::InsufficientData { .. }));
        }
        assert!(sampler.sample(&mut rng, Split::Train, 1, 62).is_ok());
    }

    #[test]
    fn test_same_seed_same_windows() {
        let sampler = sampler(1_000);
        let a = sampler
            .sample(&mut StdRng::seed_from_u64(3), Split::Train, 8, 16)
            .unwrap();
        let b = sampler
            .sample(&mut StdRng::seed_from_u64(3), Split::Train, 8, 16)
            .unwrap();
        assert_eq!(a, b);
    }
}
