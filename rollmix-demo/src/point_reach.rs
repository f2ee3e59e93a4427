use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rollmix_core::{
    env::{Env, Transition},
    observation::Observation,
};

const STEP_SIZE: f32 = 0.1;
const GOAL_RADIUS: f32 = 0.05;
const RENDER_FPS: f64 = 10.;

/// A point in `[-1, 1]^2` that has to reach a goal. Actions are velocities clipped to
/// `[-1, 1]`, the reward is the negative distance to the goal.
pub struct PointReach {
    rng: StdRng,
    pos: [f32; 2],
    goal: [f32; 2],
    t: usize,
    max_episode_steps: usize,
    image_size: usize,
}

impl PointReach {
    pub fn new(max_episode_steps: usize, image_size: usize) -> Result<Self> {
        ensure!(
            image_size >= 4,
            "frames need at least 4x4 pixels, got an image size of {image_size}"
        );
        ensure!(max_episode_steps > 0, "episodes need at least one step");
        Ok(Self {
            rng: StdRng::seed_from_u64(rand::random()),
            pos: [0.; 2],
            goal: [0.; 2],
            t: 0,
            max_episode_steps,
            image_size,
        })
    }

    fn distance(&self) -> f32 {
        let dx = self.goal[0] - self.pos[0];
        let dy = self.goal[1] - self.pos[1];
        (dx * dx + dy * dy).sqrt()
    }

    fn to_pixel(&self, coord: f32) -> usize {
        (((coord + 1.) / 2.) * (self.image_size - 1) as f32).round() as usize
    }

    fn frame(&self) -> Result<Tensor> {
        let size = self.image_size;
        let mut pixels = vec![255u8; size * size * 3];
        let mut paint = |x: f32, y: f32, rgb: [u8; 3]| {
            let (cx, cy) = (self.to_pixel(x), self.to_pixel(y));
            for row in cy.saturating_sub(1)..=(cy + 1).min(size - 1) {
                for col in cx.saturating_sub(1)..=(cx + 1).min(size - 1) {
                    let offset = (row * size + col) * 3;
                    pixels[offset..offset + 3].copy_from_slice(&rgb);
                }
            }
        };
        paint(self.goal[0], self.goal[1], [40, 180, 60]);
        paint(self.pos[0], self.pos[1], [200, 40, 40]);
        Ok(Tensor::from_vec(pixels, (size, size, 3), &Device::Cpu)?)
    }

    fn observation(&self) -> Result<Observation> {
        Ok(Observation::new()
            .with("agent_pos", Tensor::new(&self.pos, &Device::Cpu)?)
            .with("environment_state", Tensor::new(&self.goal, &Device::Cpu)?)
            .with("pixels", self.frame()?))
    }
}

impl Env for PointReach {
    fn reset(&mut self, seed: Option<u64>) -> Result<Observation> {
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        self.pos = [self.rng.random_range(-1.0..1.0), self.rng.random_range(-1.0..1.0)];
        self.goal = [self.rng.random_range(-1.0..1.0), self.rng.random_range(-1.0..1.0)];
        self.t = 0;
        self.observation()
    }

    fn step(&mut self, action: &Tensor) -> Result<Transition> {
        let action = action.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        ensure!(action.len() == 2, "expected a 2d velocity, got {action:?}");
        for (pos, velocity) in self.pos.iter_mut().zip(action) {
            *pos = (*pos + velocity.clamp(-1., 1.) * STEP_SIZE).clamp(-1., 1.);
        }
        self.t += 1;
        let distance = self.distance();
        let terminated = distance < GOAL_RADIUS;
        Ok(Transition {
            observation: self.observation()?,
            reward: -distance,
            terminated,
            truncated: !terminated && self.t >= self.max_episode_steps,
            is_success: terminated,
        })
    }

    fn render(&mut self) -> Result<Tensor> {
        self.frame()
    }

    fn max_episode_steps(&self) -> usize {
        self.max_episode_steps
    }

    fn render_fps(&self) -> f64 {
        RENDER_FPS
    }
}
