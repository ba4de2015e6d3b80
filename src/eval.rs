use anyhow::Result;

use crate::dqn::QNetworkPair;
use crate::env::{Action, EnvConfig, MarioEnv};
use crate::wrappers::{MarioPipeline, PipelineConfig};

pub struct EvalStats {
    pub avg_reward: f64,
    pub avg_max_x: f64,
    pub avg_steps: f64,
    pub flags: usize,
    pub episodes: usize,
}

/// Greedy evaluation through the full preprocessing/shaping pipeline
pub fn run_eval(
    pair: &QNetworkPair,
    rom: std::path::PathBuf,
    frame_skip: u32,
    episodes: usize,
    max_steps: u64,
) -> Result<EvalStats> {
    let env = MarioEnv::new(rom, true, EnvConfig::default())?;
    let config = PipelineConfig {
        frame_skip,
        ..Default::default()
    };
    let mut pipeline = MarioPipeline::new(env, config);

    let mut total_reward = 0.0f64;
    let mut total_max_x = 0i64;
    let mut total_steps = 0u64;
    let mut flags = 0usize;

    let eval_episodes = episodes.max(1);

    for _ in 0..eval_episodes {
        let mut obs = pipeline.reset()?;
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u64;
        let mut ep_max_x = 0i32;

        loop {
            let action = pair.best_action(&obs)?;
            let result = pipeline.step(Action::from_index(action))?;
            ep_reward += result.reward;
            ep_steps += 1;
            ep_max_x = ep_max_x.max(result.info.x_pos);
            obs = result.observation;

            if result.done || ep_steps >= max_steps {
                if result.info.flag_get {
                    flags += 1;
                }
                break;
            }
        }

        total_reward += ep_reward;
        total_max_x += ep_max_x as i64;
        total_steps += ep_steps;
    }

    let denom = eval_episodes as f64;
    Ok(EvalStats {
        avg_reward: total_reward / denom,
        avg_max_x: total_max_x as f64 / denom,
        avg_steps: total_steps as f64 / denom,
        flags,
        episodes: eval_episodes,
    })
}
