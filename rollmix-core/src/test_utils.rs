use crate::{
    boundary::BoundaryInfo,
    env::{Env, Transition},
    episodes::{CompiledEpisodes, compile_episode_data},
    error::Result,
    observation::Observation,
    policy::Policy,
    rollout::RolloutBatch,
};
use anyhow::bail;
use candle_core::{DType, Device, Tensor};

/// Environment whose episodes last exactly `steps` steps. The reward of a step is its 1 based
/// step number, the state is the number of steps taken so far.
#[derive(Debug, Clone)]
pub struct CountdownEnv {
    steps: usize,
    t: usize,
    success: bool,
    pixels: Option<(usize, usize)>,
    fail_at: Option<usize>,
    max_episode_steps: usize,
    seeds: Vec<Option<u64>>,
}

impl CountdownEnv {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            t: 0,
            success: false,
            pixels: None,
            fail_at: None,
            max_episode_steps: 100,
            seeds: vec![],
        }
    }

    /// Reports success when the episode terminates.
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Adds `(h, w, 3)` pixels to the observations.
    pub fn with_pixels(mut self, h: usize, w: usize) -> Self {
        self.pixels = Some((h, w));
        self
    }

    /// Fails on the `step`-th step call.
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Seeds of every reset so far, `None` for the unseeded ones.
    pub fn seeds(&self) -> &[Option<u64>] {
        &self.seeds
    }

    fn frame(&self) -> candle_core::Result<Tensor> {
        let (h, w) = self.pixels.unwrap_or((8, 8));
        Tensor::full((self.t * 10).min(255) as u8, (h, w, 3), &Device::Cpu)
    }

    fn observation(&self) -> anyhow::Result<Observation> {
        let mut observation =
            Observation::new().with("agent_pos", Tensor::new(&[self.t as f32], &Device::Cpu)?);
        if self.pixels.is_some() {
            observation.insert("pixels".to_owned(), self.frame()?);
        }
        Ok(observation)
    }
}

impl Env for CountdownEnv {
    fn reset(&mut self, seed: Option<u64>) -> anyhow::Result<Observation> {
        self.seeds.push(seed);
        self.t = 0;
        self.observation()
    }

    fn step(&mut self, _action: &Tensor) -> anyhow::Result<Transition> {
        self.t += 1;
        if self.fail_at == Some(self.t) {
            bail!("countdown environment failed at step {}", self.t);
        }
        let terminated = self.t >= self.steps;
        Ok(Transition {
            observation: self.observation()?,
            reward: self.t as f32,
            terminated,
            truncated: false,
            is_success: terminated && self.success,
        })
    }

    fn render(&mut self) -> anyhow::Result<Tensor> {
        Ok(self.frame()?)
    }

    fn max_episode_steps(&self) -> usize {
        self.max_episode_steps
    }

    fn render_fps(&self) -> f64 {
        10.
    }
}

/// Policy answering every observation with zeros.
#[derive(Debug, Clone)]
pub struct ConstantPolicy {
    action_dim: usize,
    flat: bool,
    resets: usize,
}

impl ConstantPolicy {
    pub fn new(action_dim: usize) -> Self {
        Self {
            action_dim,
            flat: false,
            resets: 0,
        }
    }

    /// A policy that forgets the batch dimension of its actions.
    pub fn flat(action_dim: usize) -> Self {
        Self {
            flat: true,
            ..Self::new(action_dim)
        }
    }

    pub fn resets(&self) -> usize {
        self.resets
    }
}

impl Policy for ConstantPolicy {
    fn reset(&mut self) {
        self.resets += 1;
    }

    fn select_action(&mut self, observation: &Observation) -> anyhow::Result<Tensor> {
        let Some(batch_size) = observation.values().next().map(|value| value.dims()[0]) else {
            bail!("empty observation");
        };
        if self.flat {
            return Ok(Tensor::zeros(self.action_dim, DType::F32, &Device::Cpu)?);
        }
        Ok(Tensor::zeros(
            (batch_size, self.action_dim),
            DType::F32,
            &Device::Cpu,
        )?)
    }
}

/// Compiles zero based episodes of the given lengths, as a single rollout would produce them.
pub fn synthetic_episodes(lengths: &[usize]) -> Result<CompiledEpisodes> {
    let batch_size = lengths.len();
    let n_steps = lengths.iter().copied().max().unwrap_or(0);
    let mut done = Vec::with_capacity(batch_size * n_steps);
    for len in lengths {
        done.extend((0..n_steps).map(|step| u8::from(step + 1 >= *len)));
    }
    let done = Tensor::from_vec(done, (batch_size, n_steps), &Device::Cpu)?;
    let reward = Tensor::arange(0f32, (batch_size * n_steps) as f32, &Device::Cpu)?
        .reshape((batch_size, n_steps))?;
    let observation = Observation::new().with(
        "observation.state",
        Tensor::zeros((batch_size, n_steps + 1, 2), DType::F32, &Device::Cpu)?,
    );
    let rollout = RolloutBatch {
        action: Tensor::zeros((batch_size, n_steps, 1), DType::F32, &Device::Cpu)?,
        reward,
        success: Tensor::zeros((batch_size, n_steps), DType::U8, &Device::Cpu)?,
        done: done.clone(),
        observation: Some(observation),
    };
    let boundary = BoundaryInfo::resolve(&done)?;
    compile_episode_data(&rollout, &boundary, 0, 0, 10.)
}
