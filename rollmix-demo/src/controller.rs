use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rollmix_core::{
    observation::{ENV_STATE_KEY, Observation, STATE_KEY},
    policy::{Policy, PolicyWithUpdate},
};

/// Steers towards the goal with a velocity proportional to the remaining offset, plus uniform
/// exploration noise.
pub struct ProportionalController {
    pub gain: f64,
    pub noise: f32,
    /// Multiplies `noise` on every update.
    pub noise_decay: f32,
    rng: StdRng,
}

impl ProportionalController {
    pub fn new(gain: f64, noise: f32, seed: u64) -> Self {
        Self {
            gain,
            noise,
            noise_decay: 1.,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_noise_decay(mut self, noise_decay: f32) -> Self {
        self.noise_decay = noise_decay;
        self
    }
}

impl Policy for ProportionalController {
    fn reset(&mut self) {}

    fn select_action(&mut self, observation: &Observation) -> Result<Tensor> {
        let state = observation.get(STATE_KEY).context("missing agent state")?;
        let goal = observation
            .get(ENV_STATE_KEY)
            .context("missing goal in the environment state")?;
        let action = (goal - state)?.affine(self.gain, 0.)?;
        let action = if self.noise > 0. {
            let noise = (0..action.elem_count())
                .map(|_| self.rng.random_range(-self.noise..=self.noise))
                .collect::<Vec<f32>>();
            (action + Tensor::from_vec(noise, state.dims(), state.device())?)?
        } else {
            action
        };
        Ok(action.clamp(-1f32, 1f32)?.to_dtype(DType::F32)?)
    }
}

impl PolicyWithUpdate for ProportionalController {
    fn update(&mut self) {
        self.noise *= self.noise_decay;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    fn observation(state: &[f32; 2], goal: &[f32; 2]) -> Result<Observation> {
        Ok(Observation::new()
            .with(STATE_KEY, Tensor::new(&[*state], &Device::Cpu)?)
            .with(ENV_STATE_KEY, Tensor::new(&[*goal], &Device::Cpu)?))
    }

    #[test]
    fn steers_towards_the_goal() -> Result<()> {
        let mut policy = ProportionalController::new(2., 0., 0);
        let action = policy.select_action(&observation(&[0., 0.], &[0.1, -1.])?)?;
        assert_eq!(action.to_vec2::<f32>()?, vec![vec![0.2, -1.]]);
        Ok(())
    }

    #[test]
    fn updates_decay_the_exploration_noise() -> Result<()> {
        let mut policy = ProportionalController::new(1., 0.5, 0).with_noise_decay(0.5);
        policy.update();
        assert_eq!(policy.noise, 0.25);
        let action = policy.select_action(&observation(&[0., 0.], &[0., 0.])?)?;
        assert!(action.abs()?.max_all()?.to_scalar::<f32>()? <= 0.25);
        policy.noise_decay = 0.;
        policy.update();
        let action = policy.select_action(&observation(&[0., 0.], &[0., 0.])?)?;
        assert_eq!(action.to_vec2::<f32>()?, vec![vec![0., 0.]]);
        Ok(())
    }
}
