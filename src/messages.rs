use serde::{Deserialize, Serialize};

use crate::models::{ArtworkId, DisplayCaps, Entity, EntityId, SceneId};
use crate::placement::{AnimationKind, InitialState};

/// Control messages a display sends over its socket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "display.hello")]
    DisplayHello(DisplayHello),
    #[serde(rename = "state.report")]
    StateReport(StateReport),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DisplayHello {
    pub display_key: String,
    pub scene_id: SceneId,
    #[serde(default)]
    pub caps: DisplayCaps,
}

/// Client-side simulation snapshot. Informational only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateReport {
    pub entity_id: EntityId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub angle: f64,
    pub scale: f64,
    pub ts: i64,
}

/// Events fanned out to a scene room.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "entity.add")]
    EntityAdd {
        entity_id: EntityId,
        artwork_url: String,
        init: InitialState,
        animation_kind: AnimationKind,
        seed: u64,
    },
    #[serde(rename = "scene.reset")]
    SceneReset { hard: bool },
    #[serde(rename = "entity.delete")]
    EntityDelete { artwork_id: ArtworkId },
}

impl ServerMessage {
    pub fn entity_add(entity: &Entity, artwork_url: String) -> Self {
        ServerMessage::EntityAdd {
            entity_id: entity.id,
            artwork_url,
            init: entity.placement.init,
            animation_kind: entity.placement.animation_kind,
            seed: entity.placement.seed,
        }
    }
}
