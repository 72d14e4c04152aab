//! Initial kinematic state for newly placed entities.
//!
//! Displays animate entities locally; the server only hands out a starting
//! position and velocity, an animation kind and a seed each display feeds
//! into its own animation so every screen renders the same motion.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Distance kept from the scene edge when sampling the spawn band.
pub const POSITION_MARGIN: f64 = 100.0;
/// Velocity components are drawn from `-MAX_SPEED..MAX_SPEED` units per tick.
pub const MAX_SPEED: f64 = 2.0;
/// Seeds stay below 2^53 so they are exact as JavaScript numbers.
pub const SEED_LIMIT: u64 = 1 << 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationKind {
    Pulsate,
    Disperse,
    Explode,
    SpinFight,
    StreamIn,
}

impl AnimationKind {
    /// Rotation order.
    pub const ALL: [AnimationKind; 5] = [
        AnimationKind::Pulsate,
        AnimationKind::Disperse,
        AnimationKind::Explode,
        AnimationKind::SpinFight,
        AnimationKind::StreamIn,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnimationKind::Pulsate => "pulsate",
            AnimationKind::Disperse => "disperse",
            AnimationKind::Explode => "explode",
            AnimationKind::SpinFight => "spin_fight",
            AnimationKind::StreamIn => "stream_in",
        }
    }
}

impl fmt::Display for AnimationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub angle: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub init: InitialState,
    pub animation_kind: AnimationKind,
    pub seed: u64,
}

/// Caller-supplied values that take precedence over generated ones.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PlacementOverrides {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub vx: Option<f64>,
    pub vy: Option<f64>,
    pub angle: Option<f64>,
    pub scale: Option<f64>,
    pub animation_kind: Option<AnimationKind>,
}

/// Process-wide round-robin over [`AnimationKind::ALL`].
///
/// One instance is created at startup and shared by every generator; it
/// starts at the first kind and is never persisted, so a restart begins the
/// cycle again.
#[derive(Debug, Default)]
pub struct AnimationRotation {
    next: AtomicUsize,
}

impl AnimationRotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_kind(&self) -> AnimationKind {
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        AnimationKind::ALL[slot % AnimationKind::ALL.len()]
    }
}

#[derive(Debug, Clone)]
pub struct PlacementGenerator {
    rotation: Arc<AnimationRotation>,
}

impl PlacementGenerator {
    pub fn new(rotation: Arc<AnimationRotation>) -> Self {
        Self { rotation }
    }

    pub fn place(&self, scene_width: u32, scene_height: u32) -> Placement {
        self.place_with(
            &mut rand::thread_rng(),
            scene_width,
            scene_height,
            &PlacementOverrides::default(),
        )
    }

    pub fn place_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        scene_width: u32,
        scene_height: u32,
        overrides: &PlacementOverrides,
    ) -> Placement {
        let x = overrides
            .x
            .unwrap_or_else(|| sample_axis(rng, f64::from(scene_width)));
        let y = overrides
            .y
            .unwrap_or_else(|| sample_axis(rng, f64::from(scene_height)));
        let vx = overrides
            .vx
            .unwrap_or_else(|| rng.gen_range(-MAX_SPEED..MAX_SPEED));
        let vy = overrides
            .vy
            .unwrap_or_else(|| rng.gen_range(-MAX_SPEED..MAX_SPEED));
        // Only generated kinds consume a rotation slot.
        let animation_kind = overrides
            .animation_kind
            .unwrap_or_else(|| self.rotation.next_kind());

        Placement {
            init: InitialState {
                x,
                y,
                vx,
                vy,
                angle: overrides.angle.unwrap_or(0.0),
                scale: overrides.scale.unwrap_or(1.0),
            },
            animation_kind,
            seed: rng.gen_range(0..SEED_LIMIT),
        }
    }
}

/// Midpoint of the axis, offset by at most half of (half-extent - margin).
fn sample_axis<R: Rng + ?Sized>(rng: &mut R, extent: f64) -> f64 {
    let spread = (extent / 2.0 - POSITION_MARGIN).max(0.0);
    extent / 2.0 + (rng.gen::<f64>() - 0.5) * spread
}
