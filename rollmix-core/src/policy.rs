use crate::observation::Observation;
use anyhow::Result;
use candle_core::Tensor;

pub trait Policy {
    /// Clears any temporal state, called once at the start of every rollout.
    fn reset(&mut self);

    /// Returns a `(batch, action_dim)` action for a preprocessed observation batch.
    fn select_action(&mut self, observation: &Observation) -> Result<Tensor>;
}

/// A policy that keeps internal state in sync with its parameters, e.g. an exponential moving
/// average. The surrounding training loop calls `update` after every optimizer step.
pub trait PolicyWithUpdate: Policy {
    fn update(&mut self);
}
