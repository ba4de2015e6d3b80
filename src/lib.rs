/// Frames stacked into one network observation
pub const FRAME_STACK: usize = 4;
/// Side length of a preprocessed frame
pub const FRAME_SIZE: usize = 21;
pub const FRAME_AREA: usize = FRAME_SIZE * FRAME_SIZE;
/// Flattened observation length: (FRAME_STACK, FRAME_SIZE, FRAME_SIZE)
pub const OBS_DIM: usize = FRAME_STACK * FRAME_AREA;

pub type Observation = [f32; OBS_DIM];

pub mod dqn;
pub mod env;
pub mod eval;
pub mod wrappers;

pub use dqn::{CheckpointMeta, MarioNet, NetConfig, Network, QNetworkPair};
pub use env::{
    Action, EnvConfig, GameInfo, MarioBackend, MarioEnv, PowerUp, RawStep, RgbFrame, ram,
};
pub use eval::{EvalStats, run_eval};
pub use wrappers::{
    FrameStack, MarioPipeline, PipelineConfig, PipelineStep, RewardBreakdown, RewardShaper,
    ShapeConfig, ShapeState, preprocess, shape,
};
