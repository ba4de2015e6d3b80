use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;

// =============================================================================
// Environment Constants
// =============================================================================

pub const NES_WIDTH: usize = 256;
pub const NES_HEIGHT: usize = 240;

pub struct EnvConfig {
    pub reset_max_frames: u32,
    pub start_press_frames: u32,
    pub start_press_interval: u32,
    pub random_noop_range: std::ops::Range<u32>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            reset_max_frames: 900,
            start_press_frames: 2,
            start_press_interval: 30,
            random_noop_range: 1..30,
        }
    }
}

// =============================================================================
// RAM Addresses
// =============================================================================

pub mod ram {
    //! Super Mario Bros RAM map (NTSC revision)

    /// Current horizontal page (world x = page * 256 + pixel)
    pub const X_PAGE: u16 = 0x006D;
    pub const X_PIXEL: u16 = 0x0086;
    pub const LIVES: u16 = 0x075A;
    pub const COINS: u16 = 0x075E;
    /// 0 = small, 1 = tall, >= 2 = fireball
    pub const POWERUP: u16 = 0x0756;
    /// 0x06 = dies, 0x0B = dying animation
    pub const PLAYER_STATE: u16 = 0x000E;
    /// 0x03 = sliding down the flagpole
    pub const FLOAT_STATE: u16 = 0x001D;
    /// > 1 when the player has fallen below the viewport
    pub const Y_VIEWPORT: u16 = 0x00B5;
    /// 0 = title/demo, 1 = playing, 2 = victory, 3 = game over
    pub const OPER_MODE: u16 = 0x0770;

    /// Remaining time: 3 BCD digits (hundreds, tens, ones)
    pub const TIME_DIGITS: [u16; 3] = [0x07F8, 0x07F9, 0x07FA];

    /// Score: 6 BCD digits, displayed with an implicit trailing zero
    pub const SCORE_DIGITS: [u16; 6] = [0x07DE, 0x07DF, 0x07E0, 0x07E1, 0x07E2, 0x07E3];
}

// =============================================================================
// Action Space
// =============================================================================

/// The "simple movement" subset of the joypad: enough to run, jump and brake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Noop = 0,
    Right = 1,
    RightJump = 2,
    RightRun = 3,
    RightRunJump = 4,
    Jump = 5,
    Left = 6,
}

impl Action {
    pub const COUNT: usize = 7;

    pub fn from_index(i: usize) -> Self {
        assert!(i < Self::COUNT);
        // SAFETY: repr(u8) and we checked bounds
        unsafe { std::mem::transmute(i as u8) }
    }

    pub fn to_joypad(self) -> tetanes_core::input::JoypadBtnState {
        use tetanes_core::input::{JoypadBtn, JoypadBtnState};
        let mut state = JoypadBtnState::empty();
        match self {
            Action::Noop => {}
            Action::Right => {
                state.set(JoypadBtn::Right.into(), true);
            }
            Action::RightJump => {
                state.set(JoypadBtn::Right.into(), true);
                state.set(JoypadBtn::A.into(), true);
            }
            Action::RightRun => {
                state.set(JoypadBtn::Right.into(), true);
                state.set(JoypadBtn::B.into(), true);
            }
            Action::RightRunJump => {
                state.set(JoypadBtn::Right.into(), true);
                state.set(JoypadBtn::A.into(), true);
                state.set(JoypadBtn::B.into(), true);
            }
            Action::Jump => {
                state.set(JoypadBtn::A.into(), true);
            }
            Action::Left => {
                state.set(JoypadBtn::Left.into(), true);
            }
        }
        state
    }
}

// =============================================================================
// Game Info
// =============================================================================

/// Power-up tier (the game calls this the player "size")
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum PowerUp {
    #[default]
    Small,
    Tall,
    Fireball,
}

impl PowerUp {
    pub fn from_raw(v: u8) -> Self {
        match v {
            0 => PowerUp::Small,
            1 => PowerUp::Tall,
            _ => PowerUp::Fireball,
        }
    }
}

/// Structured game state read from RAM once per emulator frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GameInfo {
    pub x_pos: i32,
    pub coins: u32,
    pub status: PowerUp,
    pub time: u32,
    pub life: u8,
    pub score: u32,
    pub flag_get: bool,
}

/// One RGB frame copied out of the emulator's frame buffer
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: usize,
    pub height: usize,
    /// Row-major RGB triples, width * height * 3 bytes
    pub data: Vec<u8>,
}

impl RgbFrame {
    /// Copy an RGBA frame buffer into RGB, rejecting unexpected sizes
    pub fn from_rgba(fb: &[u8], width: usize, height: usize) -> Result<Self> {
        let expected = width * height * 4;
        if fb.len() != expected {
            anyhow::bail!(
                "Malformed frame buffer: got {} bytes, expected {} ({}x{}x4)",
                fb.len(),
                expected,
                width,
                height
            );
        }
        let mut data = Vec::with_capacity(width * height * 3);
        for px in fb.chunks_exact(4) {
            data.extend_from_slice(&px[..3]);
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

/// Result of advancing the emulator by one frame. Terminated and truncated
/// are kept separate here; the pipeline ORs them into a single done flag.
#[derive(Debug, Clone)]
pub struct RawStep {
    pub frame: RgbFrame,
    /// Native score-delta reward. The shaping wrapper discards this.
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: GameInfo,
}

/// The emulator seam: the preprocessing/shaping pipeline only ever talks to
/// this, so tests can substitute a scripted backend.
pub trait MarioBackend {
    fn reset(&mut self) -> Result<(RgbFrame, Option<GameInfo>)>;
    fn step(&mut self, action: Action) -> Result<RawStep>;
}

// =============================================================================
// NES Environment
// =============================================================================

const OPER_MODE_PLAYING: u8 = 0x01;
const OPER_MODE_VICTORY: u8 = 0x02;

const PLAYER_STATE_DIES: u8 = 0x06;
const PLAYER_STATE_DYING: u8 = 0x0B;
const FLOAT_STATE_FLAGPOLE: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Startup,
    WaitForStart,
    WaitForClock,
    Playing,
}

pub struct MarioEnv {
    deck: ControlDeck,
    pub(crate) session_state: SessionState,
    last_score: u32,
    clock_started: bool,
    real_time: bool,
    next_frame_deadline: Option<Instant>,
    rng: SmallRng,
    pub env_config: EnvConfig,
}

impl MarioEnv {
    pub fn new(rom_path: PathBuf, headless: bool, env_config: EnvConfig) -> Result<Self> {
        let mut deck = ControlDeck::new();
        // Video stays on even when headless: the agent observes pixels
        let headless_mode = if headless {
            tetanes_core::control_deck::HeadlessMode::NO_AUDIO
        } else {
            tetanes_core::control_deck::HeadlessMode::empty()
        };
        deck.set_headless_mode(headless_mode);
        deck.load_rom_path(&rom_path)
            .with_context(|| format!("Failed to load ROM: {}", rom_path.display()))?;

        Ok(Self {
            deck,
            session_state: SessionState::Startup,
            last_score: 0,
            clock_started: false,
            real_time: false,
            next_frame_deadline: None,
            rng: SmallRng::from_os_rng(),
            env_config,
        })
    }

    pub fn set_real_time(&mut self, enabled: bool) {
        self.real_time = enabled;
        self.next_frame_deadline = None;
    }

    pub fn clock_frame(&mut self) -> Result<()> {
        self.deck.clock_frame()?;
        if self.real_time {
            self.throttle_frame();
        }
        Ok(())
    }

    fn throttle_frame(&mut self) {
        let frame_duration = Duration::from_nanos(1_000_000_000 / 60);
        let now = Instant::now();
        match self.next_frame_deadline {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_frame_deadline = Some(deadline + frame_duration);
            }
            _ => {
                self.next_frame_deadline = Some(now + frame_duration);
            }
        }
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.deck.bus().peek(addr)
    }

    pub fn read_time(&self) -> u32 {
        let digits: Vec<u8> = ram::TIME_DIGITS
            .iter()
            .map(|&addr| self.peek(addr))
            .collect();
        digits_to_number(&digits)
    }

    pub fn read_score(&self) -> u32 {
        let digits: Vec<u8> = ram::SCORE_DIGITS
            .iter()
            .map(|&addr| self.peek(addr))
            .collect();
        // The score display carries an implicit trailing zero
        digits_to_number(&digits) * 10
    }

    pub fn read_info(&self) -> GameInfo {
        let life = match self.peek(ram::LIVES) {
            0xFF => 0,
            v => v,
        };
        let float_state = self.peek(ram::FLOAT_STATE);
        let oper_mode = self.peek(ram::OPER_MODE);
        GameInfo {
            x_pos: self.peek(ram::X_PAGE) as i32 * 256 + self.peek(ram::X_PIXEL) as i32,
            coins: self.peek(ram::COINS) as u32,
            status: PowerUp::from_raw(self.peek(ram::POWERUP)),
            time: self.read_time(),
            life,
            score: self.read_score(),
            flag_get: float_state == FLOAT_STATE_FLAGPOLE || oper_mode == OPER_MODE_VICTORY,
        }
    }

    fn grab_frame(&mut self) -> Result<RgbFrame> {
        let fb = self.deck.frame_buffer();
        RgbFrame::from_rgba(fb, NES_WIDTH, NES_HEIGHT)
    }

    fn set_input(&mut self, action: Action) {
        let btn_state = action.to_joypad();
        self.set_input_state(btn_state);
    }

    pub fn set_input_state(&mut self, btn_state: tetanes_core::input::JoypadBtnState) {
        use tetanes_core::input::JoypadBtnState;
        let joypad = self.deck.joypad_mut(Player::One);
        for button in [
            JoypadBtnState::LEFT,
            JoypadBtnState::RIGHT,
            JoypadBtnState::UP,
            JoypadBtnState::DOWN,
            JoypadBtnState::A,
            JoypadBtnState::B,
            JoypadBtnState::START,
            JoypadBtnState::SELECT,
        ] {
            joypad.set_button(button, btn_state.contains(button));
        }
    }

    pub fn press_start(&mut self, frames: u32) -> Result<()> {
        use tetanes_core::input::JoypadBtnState;
        let mut btn_state = JoypadBtnState::empty();
        btn_state.set(JoypadBtnState::START, true);
        for _ in 0..frames {
            self.set_input_state(btn_state);
            self.clock_frame()?;
        }
        self.set_input_state(tetanes_core::input::JoypadBtnState::empty());
        Ok(())
    }

    /// Drive the title screen until the in-game clock is running
    fn run_start_machine(&mut self, max_frames: u32) -> Result<()> {
        let mut frames = 0u32;
        let mut since_press = self.env_config.start_press_interval;
        let mut clock_at_entry = 0u32;

        while frames < max_frames {
            match self.session_state {
                SessionState::Startup => {
                    self.session_state = SessionState::WaitForStart;
                }
                SessionState::WaitForStart => {
                    if self.peek(ram::OPER_MODE) == OPER_MODE_PLAYING && self.read_time() > 0 {
                        clock_at_entry = self.read_time();
                        self.session_state = SessionState::WaitForClock;
                    } else if since_press >= self.env_config.start_press_interval {
                        self.press_start(self.env_config.start_press_frames)?;
                        frames = frames.saturating_add(self.env_config.start_press_frames);
                        since_press = 0;
                    } else {
                        self.clock_frame()?;
                        frames = frames.saturating_add(1);
                        since_press += 1;
                    }
                }
                SessionState::WaitForClock => {
                    let time = self.read_time();
                    if time > 0 && time != clock_at_entry {
                        self.session_state = SessionState::Playing;
                        return Ok(());
                    }
                    self.clock_frame()?;
                    frames = frames.saturating_add(1);
                }
                SessionState::Playing => return Ok(()),
            }
        }
        Ok(())
    }

    fn is_dying(&self) -> bool {
        let player_state = self.peek(ram::PLAYER_STATE);
        player_state == PLAYER_STATE_DIES
            || player_state == PLAYER_STATE_DYING
            || self.peek(ram::Y_VIEWPORT) > 1
    }
}

impl MarioBackend for MarioEnv {
    fn reset(&mut self) -> Result<(RgbFrame, Option<GameInfo>)> {
        self.deck.reset(ResetKind::Soft);
        self.session_state = SessionState::Startup;
        self.clock_started = false;

        let noops = self
            .rng
            .random_range(self.env_config.random_noop_range.clone());
        for _ in 0..noops {
            self.clock_frame()?;
        }

        self.run_start_machine(self.env_config.reset_max_frames)?;
        if self.session_state != SessionState::Playing {
            anyhow::bail!(
                "Timed out waiting for play state (phase: {phase:?}, mode: 0x{mode:02X}, time: {time})",
                phase = self.session_state,
                mode = self.peek(ram::OPER_MODE),
                time = self.read_time()
            );
        }

        let info = self.read_info();
        self.last_score = info.score;
        self.clock_started = info.time > 0;
        let frame = self.grab_frame()?;
        Ok((frame, Some(info)))
    }

    fn step(&mut self, action: Action) -> Result<RawStep> {
        self.set_input(action);
        self.clock_frame()?;

        let info = self.read_info();
        let reward = info.score.saturating_sub(self.last_score) as f64;
        self.last_score = info.score;
        if info.time > 0 {
            self.clock_started = true;
        }

        let terminated = self.is_dying() || info.flag_get;
        let truncated = self.clock_started && info.time == 0;
        let frame = self.grab_frame()?;

        Ok(RawStep {
            frame,
            reward,
            terminated,
            truncated,
            info,
        })
    }
}

/// Decode a run of BCD digits, most significant first
pub fn digits_to_number(digits: &[u8]) -> u32 {
    digits
        .iter()
        .fold(0u32, |acc, &d| acc * 10 + (d & 0x0F) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_index_round_trip() {
        for i in 0..Action::COUNT {
            assert_eq!(Action::from_index(i) as usize, i);
        }
    }

    #[test]
    fn powerup_tier_mapping() {
        assert_eq!(PowerUp::from_raw(0), PowerUp::Small);
        assert_eq!(PowerUp::from_raw(1), PowerUp::Tall);
        assert_eq!(PowerUp::from_raw(2), PowerUp::Fireball);
        // Fire flower stacks read back as higher raw values
        assert_eq!(PowerUp::from_raw(3), PowerUp::Fireball);
    }

    #[test]
    fn bcd_digits_decode() {
        assert_eq!(digits_to_number(&[4, 0, 0]), 400);
        assert_eq!(digits_to_number(&[0, 0, 0]), 0);
        // High nibbles are display attributes and must be masked off
        assert_eq!(digits_to_number(&[0xF1, 0xF2, 0xF3]), 123);
    }

    #[test]
    fn malformed_frame_buffer_is_rejected() {
        let err = RgbFrame::from_rgba(&[0u8; 100], NES_WIDTH, NES_HEIGHT).unwrap_err();
        assert!(err.to_string().contains("Malformed frame buffer"));
    }

    #[test]
    fn rgba_to_rgb_copies_pixels() {
        let mut fb = vec![0u8; NES_WIDTH * NES_HEIGHT * 4];
        fb[0] = 10;
        fb[1] = 20;
        fb[2] = 30;
        fb[3] = 255;
        let frame = RgbFrame::from_rgba(&fb, NES_WIDTH, NES_HEIGHT).unwrap();
        assert_eq!(frame.data.len(), NES_WIDTH * NES_HEIGHT * 3);
        assert_eq!(&frame.data[..3], &[10, 20, 30]);
    }
}
