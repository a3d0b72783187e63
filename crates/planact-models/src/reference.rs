//! Single-block CPU language model with a causal prefix-mean context.
//!
//! ```text
//! h      = embed(x)                        (or the given vectors)
//! c_t    = mean(h_0..=h_t)
//! u      = h + softplus(position_bias_mult) * c
//! r      = h + u @ expand
//! logits = (r * norm) @ outputs
//! ```
//!
//! Parameter names follow the usual transformer layout so that keyword-based
//! parameter grouping sees embeddings, a position bias, a norm and an output
//! projection.
//!
//! The model has no attention mask: acting spans passed to `forward` are
//! only validated for length.

use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use planact_core::{ActingSpan, LanguageModel, ModelInput, NamedParameter, PlanActError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

const EMBEDDING: usize = 0;
const EXPAND: usize = 1;
const POSITION_BIAS: usize = 2;
const NORM: usize = 3;
const OUTPUTS: usize = 4;

/// Shape and initialization of a [`ReferenceLm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLmConfig {
    /// Rows of the embedding table, special tokens included.
    pub vocab_size: usize,

    /// Hidden width.
    #[serde(default = "default_width")]
    pub width: usize,

    /// Initialization seed.
    #[serde(default)]
    pub seed: u64,
}

impl ReferenceLmConfig {
    /// Config with the default width and seed 0.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            width: default_width(),
            seed: 0,
        }
    }

    /// Set the hidden width.
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Set the initialization seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Trainable scalars of a model built from this config.
    pub fn num_parameters(&self) -> usize {
        let (v, d) = (self.vocab_size, self.width);
        v * d + d * d + 1 + d + d * v
    }
}

fn default_width() -> usize {
    64
}

/// Activations kept from the last forward pass.
#[derive(Debug)]
struct ForwardCache {
    tokens: Option<Array2<u32>>,
    batch: usize,
    length: usize,
    context: Array2<f32>,
    mixed: Array2<f32>,
    residual: Array2<f32>,
    normed: Array2<f32>,
    bias_scale: f32,
}

/// CPU reference model.
#[derive(Debug)]
pub struct ReferenceLm {
    config: ReferenceLmConfig,
    params: Vec<NamedParameter>,
    cache: Option<ForwardCache>,
}

impl ReferenceLm {
    /// Build and randomly initialize a model.
    pub fn new(config: ReferenceLmConfig) -> Result<Self> {
        if config.vocab_size == 0 || config.width == 0 {
            return Err(PlanActError::config(
                "reference model needs a positive vocab size and width",
            ));
        }
        let (v, d) = (config.vocab_size, config.width);
        let scale = (d as f32).sqrt().recip();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let embedding = normal_matrix(&mut rng, (v, d), 0.25 * scale)?;
        let expand = normal_matrix(&mut rng, (d, d), 0.25 * scale)?;
        let outputs = normal_matrix(&mut rng, (d, v), 0.5 * scale)?;

        let params = vec![
            NamedParameter::new("embedding.weight", embedding.into_dyn()),
            NamedParameter::new("blocks.0.expand", expand.into_dyn()),
            NamedParameter::new("blocks.0.position_bias_mult", ArrayD::from_elem(vec![1], 1.0)),
            NamedParameter::new("norm.weight", Array1::<f32>::ones(d).into_dyn()),
            NamedParameter::new("outputs.weight", outputs.into_dyn()),
        ];
        tracing::debug!(
            vocab_size = v,
            width = d,
            num_params = config.num_parameters(),
            "Initialized reference model"
        );

        Ok(Self {
            config,
            params,
            cache: None,
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ReferenceLmConfig {
        &self.config
    }

    fn matrix(&self, index: usize) -> Result<ArrayView2<'_, f32>> {
        self.params[index]
            .value
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| PlanActError::Model(format!("{}: {e}", self.params[index].name)))
    }

    fn vector(&self, index: usize) -> Result<ArrayView1<'_, f32>> {
        self.params[index]
            .value
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| PlanActError::Model(format!("{}: {e}", self.params[index].name)))
    }

    fn position_bias(&self) -> f32 {
        self.params[POSITION_BIAS].value.sum()
    }

    /// Embedding rows for every token, flattened to `(batch * length, width)`.
    fn gather(&self, tokens: &Array2<u32>) -> Result<Array2<f32>> {
        let embedding = self.matrix(EMBEDDING)?;
        let mut hidden = Array2::zeros((tokens.len(), self.config.width));
        for (mut row, &token) in hidden.rows_mut().into_iter().zip(tokens.iter()) {
            let token = token as usize;
            if token >= self.config.vocab_size {
                return Err(PlanActError::Model(format!(
                    "token {token} outside a vocabulary of {}",
                    self.config.vocab_size
                )));
            }
            row.assign(&embedding.row(token));
        }
        Ok(hidden)
    }
}

impl LanguageModel for ReferenceLm {
    fn embed(&self, tokens: &Array2<u32>) -> Result<Array3<f32>> {
        let (batch, length) = tokens.dim();
        self.gather(tokens)?
            .into_shape((batch, length, self.config.width))
            .map_err(|e| PlanActError::Model(e.to_string()))
    }

    /// Context is a causal prefix mean rather than masked attention, so an
    /// acting span has nothing to change. A given span is checked against
    /// the input length and otherwise ignored.
    fn forward(&mut self, input: &ModelInput, span: Option<ActingSpan>) -> Result<Array3<f32>> {
        let (batch, length) = input.batch_and_length();
        let width = self.config.width;
        if let Some(span) = span {
            if span.length() != length {
                return Err(PlanActError::InvalidArgument(format!(
                    "acting span for length {} given an input of length {length}",
                    span.length()
                )));
            }
        }

        let (hidden, tokens) = match input {
            ModelInput::Tokens(tokens) => (self.gather(tokens)?, Some(tokens.clone())),
            ModelInput::Embeddings(vectors) => {
                if vectors.len_of(Axis(2)) != width {
                    return Err(PlanActError::ShapeMismatch {
                        expected: vec![batch, length, width],
                        actual: vectors.shape().to_vec(),
                    });
                }
                let flat = vectors
                    .to_shape((batch * length, width))
                    .map_err(|e| PlanActError::Model(e.to_string()))?
                    .to_owned();
                (flat, None)
            }
        };

        let context = prefix_mean(&hidden, batch, length);
        let bias_scale = softplus(self.position_bias());
        let mixed = &hidden + &(&context * bias_scale);
        let residual = &hidden + &mixed.dot(&self.matrix(EXPAND)?);
        let normed = &residual * &self.vector(NORM)?;
        let logits = normed.dot(&self.matrix(OUTPUTS)?);

        self.cache = Some(ForwardCache {
            tokens,
            batch,
            length,
            context,
            mixed,
            residual,
            normed,
            bias_scale,
        });

        logits
            .into_shape((batch, length, self.config.vocab_size))
            .map_err(|e| PlanActError::Model(e.to_string()))
    }

    fn backward(&mut self, grad_logits: &Array3<f32>) -> Result<()> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| PlanActError::Model("backward called before forward".to_string()))?;
        let (batch, length, vocab) = grad_logits.dim();
        if (batch, length, vocab) != (cache.batch, cache.length, self.config.vocab_size) {
            return Err(PlanActError::ShapeMismatch {
                expected: vec![cache.batch, cache.length, self.config.vocab_size],
                actual: vec![batch, length, vocab],
            });
        }
        let rows = batch * length;
        let grad_logits = grad_logits
            .to_shape((rows, vocab))
            .map_err(|e| PlanActError::Model(e.to_string()))?;

        let d_outputs = cache.normed.t().dot(&grad_logits);
        let d_normed = grad_logits.dot(&self.matrix(OUTPUTS)?.t());
        let d_norm = (&cache.residual * &d_normed).sum_axis(Axis(0));
        let d_residual = &d_normed * &self.vector(NORM)?;
        let d_expand = cache.mixed.t().dot(&d_residual);
        let d_mixed = d_residual.dot(&self.matrix(EXPAND)?.t());
        let d_bias = (&cache.context * &d_mixed).sum() * sigmoid(self.position_bias());

        let mut d_hidden = &d_residual + &d_mixed;
        let d_context = &d_mixed * cache.bias_scale;
        for b in 0..batch {
            let mut suffix = Array1::<f32>::zeros(self.config.width);
            for t in (0..length).rev() {
                let row = b * length + t;
                suffix.scaled_add(((t + 1) as f32).recip(), &d_context.row(row));
                let mut target = d_hidden.row_mut(row);
                target += &suffix;
            }
        }

        self.params[OUTPUTS].grad += &d_outputs.into_dyn();
        self.params[EXPAND].grad += &d_expand.into_dyn();
        self.params[NORM].grad += &d_norm.into_dyn();
        self.params[POSITION_BIAS]
            .grad
            .mapv_inplace(|g| g + d_bias);

        if let Some(tokens) = cache.tokens {
            let mut d_embedding = self.params[EMBEDDING]
                .grad
                .view_mut()
                .into_dimensionality::<Ix2>()
                .map_err(|e| PlanActError::Model(e.to_string()))?;
            for (row, &token) in tokens.iter().enumerate() {
                let mut target = d_embedding.row_mut(token as usize);
                target += &d_hidden.row(row);
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &[NamedParameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [NamedParameter] {
        &mut self.params
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}

fn normal_matrix(rng: &mut StdRng, shape: (usize, usize), std: f32) -> Result<Array2<f32>> {
    let normal = Normal::new(0.0f32, std).map_err(|e| PlanActError::config(e.to_string()))?;
    Ok(Array2::from_shape_simple_fn(shape, || normal.sample(&mut *rng)))
}

/// Running mean over positions, per sequence.
fn prefix_mean(hidden: &Array2<f32>, batch: usize, length: usize) -> Array2<f32> {
    let mut context = Array2::zeros(hidden.raw_dim());
    for b in 0..batch {
        let mut running = Array1::<f32>::zeros(hidden.ncols());
        for t in 0..length {
            let row = b * length + t;
            running += &hidden.row(row);
            context
                .row_mut(row)
                .assign(&(&running * ((t + 1) as f32).recip()));
        }
    }
    context
}

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
