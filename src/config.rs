//! Engine configuration.
//!
//! Everything has a working default. `EngineConfig` is read when the engine and the
//! window are created; `clear_colour` is also re-read every frame, so it can be changed
//! at runtime through [`Engine::config_mut`](crate::engine::Engine::config_mut).

use instant::Duration;
use log::warn;

use crate::gpu::{Color, surface::SurfacePreferences};

/// Where the physics stepper runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepMode {
    /// Stepped by the engine once per frame, before synchronization.
    #[default]
    Inline,
    /// Stepped on a dedicated thread, roughly every `interval`.
    Threaded { interval: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicsConfig {
    pub fixed_timestep: Duration,
    /// Upper bound on steps per call. Time beyond it is dropped.
    pub max_sub_steps: u32,
    pub mode: StepMode,
}

impl PhysicsConfig {
    pub const DEFAULT_FIXED_TIMESTEP: Duration = Duration::from_nanos(16_666_667);
    pub const DEFAULT_MAX_SUB_STEPS: u32 = 10;

    /// Replaces values that would stall the stepper with the defaults.
    pub fn validated(&self) -> Self {
        let mut config = *self;
        if config.fixed_timestep.is_zero() {
            warn!("fixed timestep of zero, using {:?}", Self::DEFAULT_FIXED_TIMESTEP);
            config.fixed_timestep = Self::DEFAULT_FIXED_TIMESTEP;
        }
        if config.max_sub_steps == 0 {
            warn!("max_sub_steps of zero, using {}", Self::DEFAULT_MAX_SUB_STEPS);
            config.max_sub_steps = Self::DEFAULT_MAX_SUB_STEPS;
        }
        config
    }
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: Self::DEFAULT_FIXED_TIMESTEP,
            max_sub_steps: Self::DEFAULT_MAX_SUB_STEPS,
            mode: StepMode::Inline,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub title: String,
    pub clear_colour: Color,
    pub surface: SurfacePreferences,
    pub physics: PhysicsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "scenic-bridge".to_string(),
            clear_colour: Color {
                r: 0.1,
                g: 0.2,
                b: 0.3,
                a: 1.0,
            },
            surface: SurfacePreferences::default(),
            physics: PhysicsConfig::default(),
        }
    }
}
