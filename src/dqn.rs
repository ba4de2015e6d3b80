use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::env::Action;
use crate::{FRAME_SIZE, FRAME_STACK, Observation};

// =============================================================================
// Network Hyperparameters
// =============================================================================

pub struct NetConfig {
    pub conv1_channels: usize,
    pub conv2_channels: usize,
    pub hidden_size: usize,
    pub actions: usize,
}

impl NetConfig {
    pub fn new(actions: usize) -> Self {
        Self {
            actions,
            ..Default::default()
        }
    }

    /// Spatial size after conv1 (kernel 4, stride 2)
    fn conv1_out(&self) -> usize {
        (FRAME_SIZE - 4) / 2 + 1
    }

    /// Spatial size after conv2 (kernel 3, stride 1)
    fn conv2_out(&self) -> usize {
        self.conv1_out() - 3 + 1
    }

    pub fn flat_dim(&self) -> usize {
        self.conv2_channels * self.conv2_out() * self.conv2_out()
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            conv1_channels: 64,
            conv2_channels: 64,
            hidden_size: 512,
            actions: Action::COUNT,
        }
    }
}

// =============================================================================
// Q-Network (candle)
// =============================================================================

/// Convolutional Q-network for stacked-frame input
/// Input: (batch, FRAME_STACK, FRAME_SIZE, FRAME_SIZE) → actions Q-values
pub struct MarioNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
}

impl MarioNet {
    pub fn new(vs: VarBuilder, config: &NetConfig) -> Result<Self> {
        let conv1 = candle_nn::conv2d(
            FRAME_STACK,
            config.conv1_channels,
            4,
            Conv2dConfig {
                stride: 2,
                ..Default::default()
            },
            vs.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv2d(
            config.conv1_channels,
            config.conv2_channels,
            3,
            Conv2dConfig::default(),
            vs.pp("conv2"),
        )?;
        let fc1 = candle_nn::linear(config.flat_dim(), config.hidden_size, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(config.hidden_size, config.actions, vs.pp("fc2"))?;

        Ok(Self {
            conv1,
            conv2,
            fc1,
            fc2,
        })
    }

    /// Forward pass: stacked frames → Q-values for all actions
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.conv1.forward(x)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let h = h.flatten_from(1)?;
        let h = self.fc1.forward(&h)?.relu()?;
        self.fc2.forward(&h)
    }
}

/// Which copy of the parameters to evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Online,
    Target,
}

#[derive(Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub exploration_rate: f64,
}

// =============================================================================
// Dual-Network Pair
// =============================================================================

/// Online/target pair over identical architectures. The target copy is only
/// ever overwritten wholesale by `sync_target`; nothing here computes
/// gradients into it.
pub struct QNetworkPair {
    pub online_varmap: VarMap,
    pub target_varmap: VarMap,
    online_net: MarioNet,
    target_net: MarioNet,
    device: Device,
    actions: usize,
    pub exploration_rate: f64,
    rng: SmallRng,
}

impl QNetworkPair {
    pub fn new(device: &Device, config: NetConfig) -> Result<Self> {
        let online_varmap = VarMap::new();
        let target_varmap = VarMap::new();

        let online_vb = VarBuilder::from_varmap(&online_varmap, DType::F32, device);
        let target_vb = VarBuilder::from_varmap(&target_varmap, DType::F32, device);

        let online_net = MarioNet::new(online_vb, &config)?;
        let target_net = MarioNet::new(target_vb, &config)?;

        // Shape agreement is a construction-time invariant, not a runtime one
        let probe = Tensor::zeros((1, FRAME_STACK, FRAME_SIZE, FRAME_SIZE), DType::F32, device)?;
        let online_dims = online_net.forward(&probe)?.dims().to_vec();
        let target_dims = target_net.forward(&probe)?.dims().to_vec();
        if online_dims != target_dims || online_dims != vec![1, config.actions] {
            anyhow::bail!(
                "Network shape mismatch: online {online_dims:?}, target {target_dims:?}, expected [1, {}]",
                config.actions
            );
        }

        let mut pair = Self {
            online_varmap,
            target_varmap,
            online_net,
            target_net,
            device: device.clone(),
            actions: config.actions,
            exploration_rate: 0.0,
            rng: SmallRng::from_os_rng(),
        };
        pair.sync_target()?;
        Ok(pair)
    }

    pub fn action_count(&self) -> usize {
        self.actions
    }

    fn obs_tensor(&self, obs: &Observation) -> Result<Tensor> {
        let t = Tensor::from_slice(
            obs.as_slice(),
            (1, FRAME_STACK, FRAME_SIZE, FRAME_SIZE),
            &self.device,
        )?;
        Ok(t)
    }

    /// Q-values from the selected parameter set
    pub fn evaluate(&self, obs: &Observation, which: Network) -> Result<Vec<f32>> {
        let input = self.obs_tensor(obs)?;
        let q = match which {
            Network::Online => self.online_net.forward(&input)?,
            // Detached: gradient tracking never reaches the target copy
            Network::Target => self.target_net.forward(&input)?.detach(),
        };
        let q_vals = q.squeeze(0)?.to_vec1::<f32>()?;
        Ok(q_vals)
    }

    pub fn q_values(&self, obs: &Observation) -> Result<Vec<f32>> {
        self.evaluate(obs, Network::Online)
    }

    /// Greedy action from the online network
    pub fn best_action(&self, obs: &Observation) -> Result<usize> {
        let q_vals = self.q_values(obs)?;
        let (action, _) = q_vals
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .context("empty Q-value vector")?;
        Ok(action)
    }

    /// Epsilon-greedy with a fixed, caller-owned rate
    pub fn act(&mut self, obs: &Observation, epsilon: f64) -> Result<usize> {
        if self.rng.random::<f64>() < epsilon {
            Ok(self.rng.random_range(0..self.actions))
        } else {
            self.best_action(obs)
        }
    }

    /// Copy online weights → target (hard copy)
    pub fn sync_target(&mut self) -> Result<()> {
        let online_data = self
            .online_varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock online varmap for target sync"))?;
        let mut target_data = self
            .target_varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock target varmap for target sync"))?;
        for (name, target_v) in target_data.iter_mut() {
            let online_v = online_data.get(name).ok_or_else(|| {
                anyhow::anyhow!("Missing var {name} in online varmap during target sync")
            })?;
            target_v.set(&online_v.as_tensor().detach())?;
        }
        Ok(())
    }

    /// Save online weights plus the exploration-rate scalar
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.online_varmap.save(dir.join("model.safetensors"))?;
        let meta = CheckpointMeta {
            exploration_rate: self.exploration_rate,
        };
        let file = File::create(dir.join("meta.json"))?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, &meta)?;
        Ok(())
    }

    /// Load online weights and resync the target. A missing or corrupt model
    /// file is fatal; a missing meta file just keeps the current rate.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let model_path = dir.join("model.safetensors");
        self.online_varmap
            .load(&model_path)
            .with_context(|| format!("Failed to load checkpoint: {}", model_path.display()))?;
        self.sync_target()?;

        let meta_path = dir.join("meta.json");
        if meta_path.exists() {
            let file = File::open(&meta_path)?;
            let reader = std::io::BufReader::new(file);
            let meta: CheckpointMeta = serde_json::from_reader(reader)
                .with_context(|| format!("Failed to parse {}", meta_path.display()))?;
            self.exploration_rate = meta.exploration_rate;
        }
        Ok(())
    }
}
