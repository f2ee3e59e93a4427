use crate::{
    ensure_valid,
    error::{Result, RollmixError},
};
use candle_core::{DType, Tensor};
use derive_more::{Deref, DerefMut};
use std::collections::BTreeMap;

pub const IMAGE_KEY: &str = "observation.image";
pub const IMAGES_PREFIX: &str = "observation.images.";
pub const STATE_KEY: &str = "observation.state";
pub const ENV_STATE_KEY: &str = "observation.environment_state";

/// Named observation modalities. Environments use the raw keys (`pixels`, `pixels.<camera>`,
/// `agent_pos`, `environment_state`), policies consume the `observation.*` keys produced by
/// [`preprocess_observation`].
#[derive(Debug, Clone, Default, Deref, DerefMut)]
pub struct Observation(pub BTreeMap<String, Tensor>);

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Tensor) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Stacks observations that share the same keys along a new axis `dim`.
    pub fn stack(observations: &[Observation], dim: usize) -> Result<Self> {
        let Some(first) = observations.first() else {
            return Ok(Self::default());
        };
        let mut stacked = BTreeMap::new();
        for key in first.keys() {
            let tensors = observations
                .iter()
                .map(|obs| {
                    obs.get(key).cloned().ok_or_else(|| {
                        RollmixError::Validation(format!(
                            "observation key `{key}` is missing from some elements"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            stacked.insert(key.clone(), Tensor::stack(&tensors, dim)?);
        }
        ensure_valid!(
            observations.iter().all(|obs| obs.len() == first.len()),
            "observations do not share the same keys"
        );
        Ok(Self(stacked))
    }

    /// Keeps the first `n` entries along the batch axis of every modality.
    pub fn narrow_batch(&self, n: usize) -> Result<Self> {
        let narrowed = self
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.narrow(0, 0, n)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self(narrowed))
    }
}

pub fn is_image_key(key: &str) -> bool {
    key.contains("image")
}

/// Converts a batch of raw environment observations into the representation policies expect.
///
/// Images arrive channel-last as u8 `(b, h, w, c)` and leave channel-first as f32 in `[0, 1]`.
/// State vectors are cast to f32. Keys the policy does not know about are dropped.
pub fn preprocess_observation(raw: &Observation) -> Result<Observation> {
    let mut processed = Observation::new();
    for (key, value) in raw.iter() {
        match key.as_str() {
            "pixels" => {
                processed.insert(IMAGE_KEY.to_owned(), image_to_policy(key, value)?);
            }
            "agent_pos" => {
                processed.insert(STATE_KEY.to_owned(), value.to_dtype(DType::F32)?);
            }
            "environment_state" => {
                processed.insert(ENV_STATE_KEY.to_owned(), value.to_dtype(DType::F32)?);
            }
            other => match other.strip_prefix("pixels.") {
                Some(camera) => {
                    processed.insert(format!("{IMAGES_PREFIX}{camera}"), image_to_policy(key, value)?);
                }
                None => tracing::trace!(key = other, "dropping unknown observation key"),
            },
        }
    }
    Ok(processed)
}

fn image_to_policy(key: &str, image: &Tensor) -> Result<Tensor> {
    ensure_valid!(
        image.rank() == 4,
        "expected `{key}` with shape (b, h, w, c), got {:?}",
        image.dims()
    );
    let (_, h, w, c) = image.dims4()?;
    ensure_valid!(
        c < h && c < w,
        "expected channel last images for `{key}`, got {:?}",
        image.dims()
    );
    ensure_valid!(
        image.dtype() == DType::U8,
        "expected u8 pixels for `{key}`, got {:?}",
        image.dtype()
    );
    Ok(image
        .permute((0, 3, 1, 2))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .contiguous()?)
}
