use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::placement::Placement;

pub type AssetId = u64;
pub type ArtworkId = u64;
pub type SceneId = u64;
pub type EntityId = u64;
pub type DisplayId = u64;

/// A stored image. Paths are relative to the asset root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub path: String,
    pub thumb_path: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAsset {
    pub path: String,
    pub thumb_path: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artwork {
    pub id: ArtworkId,
    pub asset_id: AssetId,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtwork {
    pub asset_id: AssetId,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewScene {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// An artwork placed in a scene. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub scene_id: SceneId,
    pub artwork_id: ArtworkId,
    #[serde(flatten)]
    pub placement: Placement,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub scene_id: SceneId,
    pub artwork_id: ArtworkId,
    pub placement: Placement,
}

/// Viewport capabilities a display reports in its hello.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayCaps {
    pub w: u32,
    pub h: u32,
    #[serde(default = "default_px_ratio")]
    pub px_ratio: f64,
}

fn default_px_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayNode {
    pub id: DisplayId,
    pub scene_id: SceneId,
    pub device_key: String,
    pub viewport_w: u32,
    pub viewport_h: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub px_ratio: f64,
    pub bound_at: DateTime<Utc>,
}

impl DisplayNode {
    pub(crate) fn apply_caps(&mut self, caps: DisplayCaps) {
        let ratio = if caps.px_ratio.is_finite() && caps.px_ratio > 0.0 {
            caps.px_ratio
        } else {
            1.0
        };
        self.viewport_w = caps.w;
        self.viewport_h = caps.h;
        self.px_ratio = ratio;
        self.pixel_width = scale_dimension(caps.w, ratio);
        self.pixel_height = scale_dimension(caps.h, ratio);
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale_dimension(value: u32, ratio: f64) -> u32 {
    (f64::from(value) * ratio).round().clamp(0.0, f64::from(u32::MAX)) as u32
}
