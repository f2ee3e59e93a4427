use super::{Env, EnvBuilder, StepInfo, VecEnv, VecStep, collate, step_autoreset};
use crate::observation::Observation;
use anyhow::{Result, ensure};
use candle_core::Tensor;

/// Steps its environments one after the other on the calling thread.
pub struct SyncVecEnv<E: Env> {
    envs: Vec<E>,
}

impl<E: Env> SyncVecEnv<E> {
    pub fn new(envs: Vec<E>) -> Result<Self> {
        ensure!(!envs.is_empty(), "a vectorized environment needs at least one environment");
        Ok(Self { envs })
    }

    pub fn from_builder<B: EnvBuilder<Env = E>>(builder: &B, n_envs: usize) -> Result<Self> {
        let envs = (0..n_envs)
            .map(|_| builder.build_env())
            .collect::<Result<Vec<_>>>()?;
        Self::new(envs)
    }

    pub fn envs(&self) -> &[E] {
        &self.envs
    }
}

impl<E: Env> VecEnv for SyncVecEnv<E> {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn max_episode_steps(&self) -> usize {
        self.envs[0].max_episode_steps()
    }

    fn render_fps(&self) -> f64 {
        self.envs[0].render_fps()
    }

    fn reset(&mut self, seeds: Option<&[u64]>) -> Result<(Observation, StepInfo)> {
        if let Some(seeds) = seeds {
            ensure!(
                seeds.len() == self.envs.len(),
                "got {} seeds for {} environments",
                seeds.len(),
                self.envs.len()
            );
        }
        let observations = self
            .envs
            .iter_mut()
            .enumerate()
            .map(|(env_idx, env)| env.reset(seeds.map(|seeds| seeds[env_idx])))
            .collect::<Result<Vec<_>>>()?;
        Ok((Observation::stack(&observations, 0)?, StepInfo::default()))
    }

    fn step(&mut self, action: &Tensor) -> Result<VecStep> {
        ensure!(
            action.dim(0)? == self.envs.len(),
            "got {} actions for {} environments",
            action.dim(0)?,
            self.envs.len()
        );
        let transitions = self
            .envs
            .iter_mut()
            .enumerate()
            .map(|(env_idx, env)| step_autoreset(env, &action.get(env_idx)?))
            .collect::<Result<Vec<_>>>()?;
        collate(transitions)
    }

    fn render(&mut self) -> Result<Tensor> {
        let frames = self
            .envs
            .iter_mut()
            .map(|env| env.render())
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&frames, 0)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::CountdownEnv;
    use candle_core::{DType, Device};

    #[test]
    fn finished_envs_report_final_info_and_reset() -> Result<()> {
        let mut env = SyncVecEnv::new(vec![
            CountdownEnv::new(2).with_success(true),
            CountdownEnv::new(3),
        ])?;
        env.reset(Some(&[7, 8]))?;
        let action = Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?;
        let step = env.step(&action)?;
        assert!(step.info.final_info.is_none());
        assert_eq!(step.info.successes(2), vec![false, false]);
        let step = env.step(&action)?;
        assert_eq!(step.terminated, vec![true, false]);
        assert_eq!(step.info.successes(2), vec![true, false]);
        // the finished environment is reset without a new seed
        assert_eq!(env.envs()[0].seeds(), &[Some(7), None]);
        Ok(())
    }

    #[test]
    fn seed_count_must_match() -> Result<()> {
        let mut env = SyncVecEnv::new(vec![CountdownEnv::new(1), CountdownEnv::new(1)])?;
        assert!(env.reset(Some(&[1])).is_err());
        Ok(())
    }
}
