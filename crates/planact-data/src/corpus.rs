//! Train and eval token streams.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use planact_core::{PlanActError, Result, Split};

/// Two flat token sequences fixed at load time.
#[derive(Debug, Clone)]
pub struct Corpus {
    train: Vec<u32>,
    eval: Vec<u32>,
}

impl Corpus {
    /// Wrap already-tokenized splits.
    pub fn new(train: Vec<u32>, eval: Vec<u32>) -> Result<Self> {
        if train.is_empty() || eval.is_empty() {
            return Err(PlanActError::InsufficientData {
                requested: 1,
                available: train.len().min(eval.len()),
            });
        }
        Ok(Self { train, eval })
    }

    /// Read two streams of little-endian `u32` token ids.
    pub fn from_token_files(train: impl AsRef<Path>, eval: impl AsRef<Path>) -> Result<Self> {
        let train = read_token_file(train.as_ref())?;
        let eval = read_token_file(eval.as_ref())?;
        tracing::info!(
            train_tokens = train.len(),
            eval_tokens = eval.len(),
            "Loaded corpus"
        );
        Self::new(train, eval)
    }

    /// Tokens of `split`.
    pub fn tokens(&self, split: Split) -> &[u32] {
        match split {
            Split::Train => &self.train,
            Split::Eval => &self.eval,
        }
    }

    /// Number of tokens in `split`.
    pub fn len(&self, split: Split) -> usize {
        self.tokens(split).len()
    }

    /// Largest token id in either split.
    pub fn max_token_id(&self) -> u32 {
        self.train
            .iter()
            .chain(self.eval.iter())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

fn read_token_file(path: &Path) -> Result<Vec<u32>> {
    let file = File::open(path)?;
    let byte_len = file.metadata()?.len() as usize;
    if byte_len % 4 != 0 {
        return Err(PlanActError::Serialization(format!(
            "{} holds {byte_len} bytes, not a whole number of u32 tokens",
            path.display()
        )));
    }
    let mut reader = BufReader::new(file);
    let mut tokens = vec![0u32; byte_len / 4];
    reader.read_u32_into::<LittleEndian>(&mut tokens)?;
    Ok(tokens)
}
