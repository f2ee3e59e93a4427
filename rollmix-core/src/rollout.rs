use crate::{
    ensure_valid,
    env::{VecEnv, VecStep},
    error::Result,
    observation::{Observation, preprocess_observation},
    policy::Policy,
    progress::progress_bar,
};
use candle_core::{DType, Device, Tensor};

/// Raw per step tensors of one batched rollout. Every tensor is `(batch, steps, ..)` except the
/// observations which carry one extra step, the observation after the last action.
#[derive(Debug, Clone)]
pub struct RolloutBatch {
    /// `(b, s, action_dim)` f32
    pub action: Tensor,
    /// `(b, s)` f32
    pub reward: Tensor,
    /// `(b, s)` u8
    pub success: Tensor,
    /// `(b, s)` u8, cumulative: stays set once an episode is done.
    pub done: Tensor,
    pub observation: Option<Observation>,
}

impl RolloutBatch {
    /// `(batch, steps)` of the rollout, read from the done flags.
    pub fn dims(&self) -> Result<(usize, usize)> {
        ensure_valid!(
            self.done.rank() == 2,
            "expected (batch, steps) done flags, got {:?}",
            self.done.dims()
        );
        Ok(self.done.dims2()?)
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.dims()?.0)
    }

    pub fn n_steps(&self) -> Result<usize> {
        Ok(self.dims()?.1)
    }

    /// Keeps the first `k` episodes of the batch.
    pub fn take_episodes(&self, k: usize) -> Result<Self> {
        let k = k.min(self.batch_size()?);
        Ok(Self {
            action: self.action.narrow(0, 0, k)?,
            reward: self.reward.narrow(0, 0, k)?,
            success: self.success.narrow(0, 0, k)?,
            done: self.done.narrow(0, 0, k)?,
            observation: self
                .observation
                .as_ref()
                .map(|observation| observation.narrow_batch(k))
                .transpose()?,
        })
    }
}

/// Runs the batched environment with `policy` until every environment finished one episode.
///
/// Environments that finish early keep stepping with the rest of the batch so that all of them
/// share one time axis, the steps after their end are masked out later on by
/// [`crate::boundary::BoundaryInfo`]. `render_callback` is invoked after the reset and after
/// every step.
pub fn rollout<V: VecEnv + ?Sized, P: Policy + ?Sized>(
    env: &mut V,
    policy: &mut P,
    seeds: Option<&[u64]>,
    return_observations: bool,
    mut render_callback: Option<&mut dyn FnMut(&mut V) -> anyhow::Result<()>>,
    enable_progbar: bool,
) -> Result<RolloutBatch> {
    let num_envs = env.num_envs();
    let max_episode_steps = env.max_episode_steps();
    tracing::debug!(num_envs, max_episode_steps, ?seeds, "starting rollout");

    policy.reset();
    let (mut observation, _) = env.reset(seeds)?;
    if let Some(callback) = render_callback.as_deref_mut() {
        callback(&mut *env)?;
    }

    let mut all_observations = vec![];
    let mut all_actions = vec![];
    let mut all_rewards = vec![];
    let mut all_successes = vec![];
    let mut all_dones = vec![];
    let mut done = vec![false; num_envs];
    let mut ever_succeeded = vec![false; num_envs];
    let progbar = progress_bar(max_episode_steps as u64, "rollout", enable_progbar);
    let mut step = 0;

    while !done.iter().all(|done| *done) {
        let policy_observation = preprocess_observation(&observation)?;
        let action = policy.select_action(&policy_observation)?;
        ensure_valid!(
            action.rank() == 2,
            "expected a (batch, action_dim) action, got {:?}",
            action.dims()
        );
        ensure_valid!(
            action.dims()[0] == num_envs,
            "policy returned {} actions for {num_envs} environments",
            action.dims()[0]
        );
        if return_observations {
            all_observations.push(policy_observation);
        }
        let action = action.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;

        let VecStep {
            observation: next_observation,
            reward,
            terminated,
            truncated,
            info,
        } = env.step(&action)?;
        if let Some(callback) = render_callback.as_deref_mut() {
            callback(&mut *env)?;
        }
        ensure_valid!(
            reward.len() == num_envs && terminated.len() == num_envs && truncated.len() == num_envs,
            "environment step returned {} rewards, {} terminated and {} truncated flags for {num_envs} environments",
            reward.len(),
            terminated.len(),
            truncated.len()
        );

        let successes = info.successes(num_envs);
        for env_idx in 0..num_envs {
            done[env_idx] |= terminated[env_idx] || truncated[env_idx];
            ever_succeeded[env_idx] |= successes[env_idx];
        }

        all_actions.push(action);
        all_rewards.push(Tensor::from_vec(reward, num_envs, &Device::Cpu)?);
        all_successes.push(flags(&successes)?);
        all_dones.push(flags(&done)?);
        observation = next_observation;
        step += 1;

        if step == max_episode_steps + 1 {
            tracing::warn!(
                max_episode_steps,
                "rollout is running past the environment's step budget"
            );
        }
        let running_success_rate =
            ever_succeeded.iter().filter(|s| **s).count() as f64 / num_envs as f64;
        progbar.set_message(format!(
            "running_success_rate={:.1}%",
            running_success_rate * 100.
        ));
        progbar.inc(1);
    }
    progbar.finish_and_clear();

    let observation = if return_observations {
        all_observations.push(preprocess_observation(&observation)?);
        Some(Observation::stack(&all_observations, 1)?)
    } else {
        None
    };
    tracing::debug!(steps = step, "rollout finished");
    Ok(RolloutBatch {
        action: Tensor::stack(&all_actions, 1)?,
        reward: Tensor::stack(&all_rewards, 1)?,
        success: Tensor::stack(&all_successes, 1)?,
        done: Tensor::stack(&all_dones, 1)?,
        observation,
    })
}

fn flags(values: &[bool]) -> Result<Tensor> {
    let values = values.iter().map(|v| u8::from(*v)).collect::<Vec<_>>();
    let len = values.len();
    Ok(Tensor::from_vec(values, len, &Device::Cpu)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        env::SyncVecEnv,
        error::RollmixError,
        observation::STATE_KEY,
        test_utils::{ConstantPolicy, CountdownEnv},
    };

    #[test]
    fn runs_until_every_env_is_done() -> Result<()> {
        let mut env = SyncVecEnv::new(vec![
            CountdownEnv::new(3).with_success(true),
            CountdownEnv::new(5),
        ])?;
        let mut policy = ConstantPolicy::new(2);
        let mut renders = 0;
        let mut count_renders = |_: &mut SyncVecEnv<CountdownEnv>| -> anyhow::Result<()> {
            renders += 1;
            Ok(())
        };
        let callback: &mut dyn FnMut(&mut SyncVecEnv<CountdownEnv>) -> anyhow::Result<()> =
            &mut count_renders;
        let batch = rollout(&mut env, &mut policy, Some(&[10, 11]), true, Some(callback), false)?;
        assert_eq!(renders, 6);
        assert_eq!(policy.resets(), 1);
        assert_eq!(batch.dims()?, (2, 5));
        assert_eq!(batch.action.dims(), &[2, 5, 2]);
        assert_eq!(
            batch.done.to_vec2::<u8>()?,
            vec![vec![0, 0, 1, 1, 1], vec![0, 0, 0, 0, 1]]
        );
        assert_eq!(batch.success.to_vec2::<u8>()?[0], vec![0, 0, 1, 0, 0]);
        let observation = batch.observation.as_ref().map(|obs| obs[STATE_KEY].dims().to_vec());
        assert_eq!(observation, Some(vec![2, 6, 1]));
        // seeded once, the environment that finished early is reset unseeded
        assert_eq!(env.envs()[0].seeds(), &[Some(10), None]);
        assert_eq!(env.envs()[1].seeds(), &[Some(11), None]);
        Ok(())
    }

    #[test]
    fn take_episodes_narrows_everything() -> Result<()> {
        let mut env = SyncVecEnv::new(vec![CountdownEnv::new(2), CountdownEnv::new(2)])?;
        let batch = rollout(&mut env, &mut ConstantPolicy::new(1), None, true, None, false)?;
        let first = batch.take_episodes(1)?;
        assert_eq!(first.batch_size()?, 1);
        assert_eq!(first.reward.dims(), &[1, 2]);
        assert_eq!(
            first.observation.map(|obs| obs[STATE_KEY].dims().to_vec()),
            Some(vec![1, 3, 1])
        );
        Ok(())
    }

    #[test]
    fn rejects_flat_actions() -> Result<()> {
        let mut env = SyncVecEnv::new(vec![CountdownEnv::new(2)])?;
        let mut policy = ConstantPolicy::flat(1);
        assert!(matches!(
            rollout(&mut env, &mut policy, None, false, None, false),
            Err(RollmixError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn environment_failures_propagate() -> Result<()> {
        let mut env = SyncVecEnv::new(vec![CountdownEnv::new(4).failing_at(2)])?;
        let result = rollout(&mut env, &mut ConstantPolicy::new(1), None, false, None, false);
        assert!(matches!(result, Err(RollmixError::Collaborator(_))));
        Ok(())
    }
}
