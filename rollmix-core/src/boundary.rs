use crate::{ensure_valid, error::Result};
use candle_core::{DType, Tensor};

/// Step at which a rollout row first reported done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneIndex {
    Done(usize),
    /// The row never finished within the rollout's step budget.
    NotDone,
}

/// Where every episode of a rollout batch ends, and which of its steps are valid.
#[derive(Debug, Clone)]
pub struct BoundaryInfo {
    pub done_indices: Vec<DoneIndex>,
    /// `(batch, steps)` u8, 1 on the steps `s <= done_index + 1`.
    pub mask: Tensor,
    n_steps: usize,
}

impl BoundaryInfo {
    /// Resolves boundaries from a cumulative `(batch, steps)` done tensor.
    pub fn resolve(done: &Tensor) -> Result<Self> {
        ensure_valid!(
            done.rank() == 2,
            "expected a (batch, steps) done tensor, got {:?}",
            done.dims()
        );
        let (batch_size, n_steps) = done.dims2()?;
        let rows = done.to_dtype(DType::U8)?.to_vec2::<u8>()?;
        let done_indices = rows
            .iter()
            .map(|row| match row.iter().position(|flag| *flag != 0) {
                Some(step) => DoneIndex::Done(step),
                None => DoneIndex::NotDone,
            })
            .collect::<Vec<_>>();
        let mut mask = Vec::with_capacity(batch_size * n_steps);
        for done_index in &done_indices {
            let valid = valid_steps(*done_index, n_steps);
            mask.extend((0..n_steps).map(|step| u8::from(step < valid)));
        }
        let mask = Tensor::from_vec(mask, (batch_size, n_steps), done.device())?;
        Ok(Self {
            done_indices,
            mask,
            n_steps,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.done_indices.len()
    }

    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    /// Number of frames in episode `idx`, its terminal step included.
    pub fn episode_len(&self, idx: usize) -> usize {
        match self.done_indices[idx] {
            DoneIndex::Done(step) => step + 1,
            DoneIndex::NotDone => self.n_steps,
        }
    }

    /// Per row sum of `values` over the valid steps.
    pub fn masked_sum(&self, values: &Tensor) -> Result<Vec<f32>> {
        Ok(self
            .masked_rows(values)?
            .map(|row| row.iter().sum())
            .collect())
    }

    /// Per row maximum of `values` over the valid steps.
    pub fn masked_max(&self, values: &Tensor) -> Result<Vec<f32>> {
        Ok(self
            .masked_rows(values)?
            .map(|row| row.iter().copied().fold(f32::NEG_INFINITY, f32::max))
            .collect())
    }

    /// Whether any valid step of a row holds a non zero value.
    pub fn masked_any(&self, values: &Tensor) -> Result<Vec<bool>> {
        Ok(self
            .masked_rows(values)?
            .map(|row| row.iter().any(|value| *value != 0.))
            .collect())
    }

    /// Keeps the first `k` rows.
    pub fn take(&self, k: usize) -> Result<Self> {
        let k = k.min(self.batch_size());
        Ok(Self {
            done_indices: self.done_indices[..k].to_vec(),
            mask: self.mask.narrow(0, 0, k)?,
            n_steps: self.n_steps,
        })
    }

    fn masked_rows(&self, values: &Tensor) -> Result<impl Iterator<Item = Vec<f32>> + '_> {
        ensure_valid!(
            values.dims() == [self.batch_size(), self.n_steps],
            "expected values of shape ({}, {}), got {:?}",
            self.batch_size(),
            self.n_steps,
            values.dims()
        );
        let rows = values.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok(rows
            .into_iter()
            .zip(&self.done_indices)
            .map(|(mut row, done_index)| {
                row.truncate(valid_steps(*done_index, self.n_steps));
                row
            }))
    }
}

fn valid_steps(done_index: DoneIndex, n_steps: usize) -> usize {
    match done_index {
        DoneIndex::Done(step) => (step + 2).min(n_steps),
        DoneIndex::NotDone => n_steps,
    }
}
