pub mod sync_vec_env;
pub mod thread_vec_env;

pub use sync_vec_env::SyncVecEnv;
pub use thread_vec_env::ThreadVecEnv;

use crate::observation::Observation;
use anyhow::Result;
use candle_core::Tensor;

pub struct Transition {
    pub observation: Observation,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
    pub is_success: bool,
}

/// A single simulated environment.
pub trait Env {
    fn reset(&mut self, seed: Option<u64>) -> Result<Observation>;
    fn step(&mut self, action: &Tensor) -> Result<Transition>;
    /// Renders the current state as a `(h, w, c)` u8 frame.
    fn render(&mut self) -> Result<Tensor>;
    fn max_episode_steps(&self) -> usize;
    fn render_fps(&self) -> f64;
}

pub trait EnvBuilder: Send + Sync + 'static {
    type Env: Env;

    fn build_env(&self) -> Result<Self::Env>;
}

impl<E: Env, F> EnvBuilder for F
where
    F: Fn() -> Result<E> + Send + Sync + 'static,
{
    type Env = E;

    fn build_env(&self) -> Result<Self::Env> {
        (self)()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalInfo {
    pub is_success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    /// Only present when at least one environment finished during the step. Holds one entry per
    /// environment, `Some` for the ones that finished.
    pub final_info: Option<Vec<Option<FinalInfo>>>,
}

impl StepInfo {
    pub fn successes(&self, num_envs: usize) -> Vec<bool> {
        match &self.final_info {
            Some(final_info) => final_info
                .iter()
                .map(|info| info.is_some_and(|info| info.is_success))
                .collect(),
            None => vec![false; num_envs],
        }
    }
}

pub struct VecStep {
    pub observation: Observation,
    pub reward: Vec<f32>,
    pub terminated: Vec<bool>,
    pub truncated: Vec<bool>,
    pub info: StepInfo,
}

/// A batch of environments advanced in lock-step. Implementations decide how the environments
/// are executed, callers only ever see batched tensors.
pub trait VecEnv {
    fn num_envs(&self) -> usize;

    fn max_episode_steps(&self) -> usize;

    fn render_fps(&self) -> f64;

    /// Resets every environment. When given, `seeds` holds one seed per environment.
    fn reset(&mut self, seeds: Option<&[u64]>) -> Result<(Observation, StepInfo)>;

    /// Steps every environment with a `(num_envs, action_dim)` action batch. Environments that
    /// finish are reset on the spot and report through [`StepInfo::final_info`].
    fn step(&mut self, action: &Tensor) -> Result<VecStep>;

    /// Renders every environment into a `(num_envs, h, w, c)` u8 tensor.
    fn render(&mut self) -> Result<Tensor>;
}

pub(crate) fn step_autoreset<E: Env + ?Sized>(env: &mut E, action: &Tensor) -> Result<Transition> {
    let mut transition = env.step(action)?;
    if transition.terminated || transition.truncated {
        transition.observation = env.reset(None)?;
    }
    Ok(transition)
}

pub(crate) fn collate(transitions: Vec<Transition>) -> Result<VecStep> {
    let num_envs = transitions.len();
    let mut observations = Vec::with_capacity(num_envs);
    let mut reward = Vec::with_capacity(num_envs);
    let mut terminated = Vec::with_capacity(num_envs);
    let mut truncated = Vec::with_capacity(num_envs);
    let mut final_info = Vec::with_capacity(num_envs);
    for transition in transitions {
        let done = transition.terminated || transition.truncated;
        final_info.push(done.then_some(FinalInfo {
            is_success: transition.is_success,
        }));
        observations.push(transition.observation);
        reward.push(transition.reward);
        terminated.push(transition.terminated);
        truncated.push(transition.truncated);
    }
    let any_finished = final_info.iter().any(Option::is_some);
    Ok(VecStep {
        observation: Observation::stack(&observations, 0)?,
        reward,
        terminated,
        truncated,
        info: StepInfo {
            final_info: any_finished.then_some(final_info),
        },
    })
}
