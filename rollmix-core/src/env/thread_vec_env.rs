use super::{Env, EnvBuilder, StepInfo, Transition, VecEnv, VecStep, collate, step_autoreset};
use crate::observation::Observation;
use anyhow::{Result, anyhow, bail, ensure};
use candle_core::Tensor;
use crossbeam::channel::{Receiver, Sender};
use std::{sync::Arc, thread::JoinHandle};

enum WorkerCommand {
    Reset(Option<u64>),
    Step(Tensor),
    Render,
    Shutdown,
}

enum WorkerResult {
    Ready {
        max_episode_steps: usize,
        render_fps: f64,
    },
    Reset(Observation),
    Step(Transition),
    Render(Tensor),
    Failed(anyhow::Error),
}

struct ThreadEnvWorker<E: Env> {
    env: E,
    rx: Receiver<WorkerCommand>,
    tx: Sender<WorkerResult>,
}

impl<E: Env> ThreadEnvWorker<E> {
    fn work(&mut self) {
        while let Ok(command) = self.rx.recv() {
            let result = match command {
                WorkerCommand::Reset(seed) => self.env.reset(seed).map(WorkerResult::Reset),
                WorkerCommand::Step(action) => {
                    step_autoreset(&mut self.env, &action).map(WorkerResult::Step)
                }
                WorkerCommand::Render => self.env.render().map(WorkerResult::Render),
                WorkerCommand::Shutdown => break,
            };
            if self.tx.send(result.unwrap_or_else(WorkerResult::Failed)).is_err() {
                break;
            }
        }
    }
}

struct WorkerHandle {
    tx: Sender<WorkerCommand>,
    rx: Receiver<WorkerResult>,
    thread: Option<JoinHandle<()>>,
}

/// Runs every environment on its own worker thread. Steps are still lock-step: a command is sent
/// to all workers and the call returns once every worker answered.
pub struct ThreadVecEnv {
    workers: Vec<WorkerHandle>,
    max_episode_steps: usize,
    render_fps: f64,
}

impl ThreadVecEnv {
    pub fn new<B: EnvBuilder>(builder: B, n_envs: usize) -> Result<Self> {
        let builder = Arc::new(builder);
        Self::spawn((0..n_envs).map(|_| builder.clone()).collect())
    }

    pub fn from_builders<B: EnvBuilder>(builders: Vec<B>) -> Result<Self> {
        Self::spawn(builders.into_iter().map(Arc::new).collect())
    }

    fn spawn<B: EnvBuilder>(builders: Vec<Arc<B>>) -> Result<Self> {
        ensure!(
            !builders.is_empty(),
            "a vectorized environment needs at least one environment"
        );
        let mut workers = Vec::with_capacity(builders.len());
        for (env_idx, builder) in builders.into_iter().enumerate() {
            let (command_tx, command_rx) = crossbeam::channel::unbounded();
            let (result_tx, result_rx) = crossbeam::channel::unbounded();
            let thread = std::thread::Builder::new()
                .name(format!("env-worker-{env_idx}"))
                .spawn(move || match builder.build_env() {
                    Ok(env) => {
                        let ready = WorkerResult::Ready {
                            max_episode_steps: env.max_episode_steps(),
                            render_fps: env.render_fps(),
                        };
                        if result_tx.send(ready).is_ok() {
                            let mut worker = ThreadEnvWorker {
                                env,
                                rx: command_rx,
                                tx: result_tx,
                            };
                            worker.work();
                        }
                    }
                    Err(err) => {
                        let _ = result_tx.send(WorkerResult::Failed(err));
                    }
                })?;
            workers.push(WorkerHandle {
                tx: command_tx,
                rx: result_rx,
                thread: Some(thread),
            });
        }
        let mut env = Self {
            workers,
            max_episode_steps: 0,
            render_fps: 0.,
        };
        let ready = env.collect()?;
        for result in ready {
            let WorkerResult::Ready {
                max_episode_steps,
                render_fps,
            } = result
            else {
                bail!("environment worker did not report readiness");
            };
            env.max_episode_steps = max_episode_steps;
            env.render_fps = render_fps;
        }
        Ok(env)
    }

    /// Sends one command per worker, then waits for every answer.
    fn broadcast(&mut self, commands: Vec<WorkerCommand>) -> Result<Vec<WorkerResult>> {
        for (env_idx, (worker, command)) in self.workers.iter().zip(commands).enumerate() {
            worker
                .tx
                .send(command)
                .map_err(|_| anyhow!("environment worker {env_idx} hung up"))?;
        }
        self.collect()
    }

    // every worker is drained before the first failure is reported, so that the channels stay in
    // step for the next command
    fn collect(&mut self) -> Result<Vec<WorkerResult>> {
        let results = self
            .workers
            .iter()
            .enumerate()
            .map(|(env_idx, worker)| {
                worker
                    .rx
                    .recv()
                    .map_err(|_| anyhow!("environment worker {env_idx} hung up"))
            })
            .collect::<Vec<_>>();
        let mut collected = Vec::with_capacity(results.len());
        for result in results {
            match result? {
                WorkerResult::Failed(err) => return Err(err),
                result => collected.push(result),
            }
        }
        Ok(collected)
    }
}

impl VecEnv for ThreadVecEnv {
    fn num_envs(&self) -> usize {
        self.workers.len()
    }

    fn max_episode_steps(&self) -> usize {
        self.max_episode_steps
    }

    fn render_fps(&self) -> f64 {
        self.render_fps
    }

    fn reset(&mut self, seeds: Option<&[u64]>) -> Result<(Observation, StepInfo)> {
        let num_envs = self.workers.len();
        let commands = match seeds {
            Some(seeds) => {
                ensure!(
                    seeds.len() == num_envs,
                    "got {} seeds for {num_envs} environments",
                    seeds.len()
                );
                seeds
                    .iter()
                    .map(|seed| WorkerCommand::Reset(Some(*seed)))
                    .collect()
            }
            None => (0..num_envs).map(|_| WorkerCommand::Reset(None)).collect(),
        };
        let observations = self
            .broadcast(commands)?
            .into_iter()
            .map(|result| match result {
                WorkerResult::Reset(observation) => Ok(observation),
                _ => Err(anyhow!("unexpected answer to a reset command")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((Observation::stack(&observations, 0)?, StepInfo::default()))
    }

    fn step(&mut self, action: &Tensor) -> Result<VecStep> {
        let num_envs = self.workers.len();
        ensure!(
            action.dim(0)? == num_envs,
            "got {} actions for {num_envs} environments",
            action.dim(0)?
        );
        let commands = (0..num_envs)
            .map(|env_idx| Ok(WorkerCommand::Step(action.get(env_idx)?)))
            .collect::<Result<Vec<_>>>()?;
        let transitions = self
            .broadcast(commands)?
            .into_iter()
            .map(|result| match result {
                WorkerResult::Step(transition) => Ok(transition),
                _ => Err(anyhow!("unexpected answer to a step command")),
            })
            .collect::<Result<Vec<_>>>()?;
        collate(transitions)
    }

    fn render(&mut self) -> Result<Tensor> {
        let commands = (0..self.workers.len()).map(|_| WorkerCommand::Render).collect();
        let frames = self
            .broadcast(commands)?
            .into_iter()
            .map(|result| match result {
                WorkerResult::Render(frame) => Ok(frame),
                _ => Err(anyhow!("unexpected answer to a render command")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&frames, 0)?)
    }
}

impl Drop for ThreadVecEnv {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerCommand::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{env::SyncVecEnv, test_utils::CountdownEnv};
    use candle_core::{DType, Device};

    #[test]
    fn matches_the_sync_env() -> Result<()> {
        let lengths = [1usize, 3, 2];
        let builders = lengths
            .iter()
            .map(|len| {
                let len = *len;
                move || -> Result<CountdownEnv> { Ok(CountdownEnv::new(len)) }
            })
            .collect::<Vec<_>>();
        let mut threaded = ThreadVecEnv::from_builders(builders)?;
        let mut sync = SyncVecEnv::new(lengths.iter().map(|len| CountdownEnv::new(*len)).collect())?;
        assert_eq!(threaded.num_envs(), 3);
        assert_eq!(threaded.max_episode_steps(), sync.max_episode_steps());

        let (threaded_obs, _) = threaded.reset(Some(&[1, 2, 3]))?;
        let (sync_obs, _) = sync.reset(Some(&[1, 2, 3]))?;
        assert_eq!(
            threaded_obs["agent_pos"].to_vec2::<f32>()?,
            sync_obs["agent_pos"].to_vec2::<f32>()?
        );
        let action = Tensor::zeros((3, 1), DType::F32, &Device::Cpu)?;
        for _ in 0..3 {
            let a = threaded.step(&action)?;
            let b = sync.step(&action)?;
            assert_eq!(a.terminated, b.terminated);
            assert_eq!(a.reward, b.reward);
        }
        assert_eq!(threaded.render()?.dims(), sync.render()?.dims());
        Ok(())
    }

    #[test]
    fn builder_failures_surface() {
        let failing = || -> Result<CountdownEnv> { Err(anyhow!("no display")) };
        assert!(ThreadVecEnv::new(failing, 2).is_err());
    }
}
