// =============================================================================
// Super Mario Bros NES — pixel-input DQN agent in Rust
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- play  --rom mario.nes --checkpoint checkpoints/best
//   cargo run --release -- eval  --rom mario.nes --checkpoint checkpoints/best
//   cargo run --release -- probe --rom mario.nes

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

use mario_rl::dqn::{NetConfig, QNetworkPair};
use mario_rl::env::{Action, EnvConfig, MarioEnv};
use mario_rl::eval::run_eval;
use mario_rl::wrappers::{MarioPipeline, PipelineConfig};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "mario-rl", about = "Super Mario Bros NES — DQN agent from pixels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a trained agent play
    Play(PlayArgs),
    /// Evaluate a trained agent headlessly
    Eval(EvalArgs),
    /// Run a random-policy baseline for reward-scale comparison
    Baseline(BaselineArgs),
    /// Step the environment with a scripted policy and dump reward shaping
    Probe(ProbeArgs),
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, default_value = "3")]
    episodes: usize,
    #[arg(long, default_value = "4")]
    frame_skip: u32,
    #[arg(long, default_value = "0.0")]
    epsilon: f64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long, default_value_t = false)]
    real_time: bool,
}

#[derive(Parser)]
struct EvalArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, default_value = "4")]
    frame_skip: u32,
    #[arg(long, default_value = "3000")]
    max_steps: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct BaselineArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, default_value = "4")]
    frame_skip: u32,
    #[arg(long, default_value = "3000")]
    max_steps: u64,
}

#[derive(Parser)]
struct ProbeArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "500")]
    steps: u64,
    #[arg(long, default_value = "50")]
    report_interval: u64,
    #[arg(long, default_value = "4")]
    frame_skip: u32,
}

// =============================================================================
// Commands
// =============================================================================

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

fn build_pipeline(rom: &PathBuf, frame_skip: u32, real_time: bool) -> Result<MarioPipeline<MarioEnv>> {
    let mut env = MarioEnv::new(rom.clone(), true, EnvConfig::default())?;
    env.set_real_time(real_time);
    let config = PipelineConfig {
        frame_skip,
        ..Default::default()
    };
    Ok(MarioPipeline::new(env, config))
}

fn play(args: &PlayArgs) -> Result<()> {
    let device = select_device(args.cpu)?;
    let mut pair = QNetworkPair::new(&device, NetConfig::new(Action::COUNT))?;
    // Checkpoint problems must surface before the first episode
    pair.load(&args.checkpoint)
        .context("Cannot start playback without a checkpoint")?;
    eprintln!("📂 Checkpoint loaded from {}", args.checkpoint.display());

    let mut pipeline = build_pipeline(&args.rom, args.frame_skip, args.real_time)?;

    for episode in 1..=args.episodes {
        let mut obs = pipeline.reset()?;
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u64;
        let mut max_x = 0i32;

        let flag = loop {
            let action = pair.act(&obs, args.epsilon)?;
            let result = pipeline.step(Action::from_index(action))?;
            ep_reward += result.reward;
            ep_steps += 1;
            max_x = max_x.max(result.info.x_pos);
            obs = result.observation;
            if result.done {
                break result.info.flag_get;
            }
        };

        let outcome = if flag { "🏁 flag" } else { "💀" };
        eprintln!(
            "Episode {episode}: reward {ep_reward:.2} | steps {ep_steps} | max x {max_x} | {outcome}"
        );
    }
    Ok(())
}

fn eval(args: &EvalArgs) -> Result<()> {
    let device = select_device(args.cpu)?;
    let mut pair = QNetworkPair::new(&device, NetConfig::new(Action::COUNT))?;
    pair.load(&args.checkpoint)
        .context("Cannot evaluate without a checkpoint")?;

    let stats = run_eval(
        &pair,
        args.rom.clone(),
        args.frame_skip,
        args.episodes,
        args.max_steps,
    )?;
    eprintln!(
        "📊 Eval over {} episodes: avg reward {:.2} | avg max x {:.1} | avg steps {:.1} | flags {}",
        stats.episodes, stats.avg_reward, stats.avg_max_x, stats.avg_steps, stats.flags
    );
    Ok(())
}

fn baseline(args: &BaselineArgs) -> Result<()> {
    let mut pipeline = build_pipeline(&args.rom, args.frame_skip, false)?;
    let mut rng = SmallRng::from_os_rng();

    let mut total_reward = 0.0f64;
    for episode in 1..=args.episodes {
        pipeline.reset()?;
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u64;
        loop {
            let action = Action::from_index(rng.random_range(0..Action::COUNT));
            let result = pipeline.step(action)?;
            ep_reward += result.reward;
            ep_steps += 1;
            if result.done || ep_steps >= args.max_steps {
                break;
            }
        }
        eprintln!("Baseline episode {episode}: reward {ep_reward:.2} | steps {ep_steps}");
        total_reward += ep_reward;
    }
    eprintln!(
        "🎲 Random baseline: avg reward {:.2} over {} episodes",
        total_reward / args.episodes as f64,
        args.episodes
    );
    Ok(())
}

fn probe(args: &ProbeArgs) -> Result<()> {
    let mut pipeline = build_pipeline(&args.rom, args.frame_skip, false)?;
    pipeline.reset()?;

    for step in 1..=args.steps {
        // Hold right+run: covers most of the shaping rules quickly
        let result = pipeline.step(Action::RightRun)?;
        if step.is_multiple_of(args.report_interval) || result.done {
            let b = pipeline.shaper().breakdown();
            let info = result.info;
            eprintln!(
                "[probe {step}] x={x} time={time} coins={coins} life={life} | progress {progress:.2} stuck {stuck:.2} time {t:.3} death {death:.1} flag {flag:.1} coins {c:.2} powerup {gain:.1}/{loss:.1}",
                x = info.x_pos,
                time = info.time,
                coins = info.coins,
                life = info.life,
                progress = b.progress,
                stuck = b.stuck,
                t = b.time,
                death = b.death,
                flag = b.flag,
                c = b.coins,
                gain = b.powerup_gain,
                loss = b.powerup_loss,
            );
            pipeline.shaper_mut().clear_breakdown();
        }
        if result.done {
            eprintln!("[probe] episode ended, resetting");
            pipeline.reset()?;
        }
    }
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Play(args) => play(args),
        Commands::Eval(args) => eval(args),
        Commands::Baseline(args) => baseline(args),
        Commands::Probe(args) => probe(args),
    }
}
