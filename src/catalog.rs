use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::{
    Artwork, ArtworkId, Asset, AssetId, DisplayCaps, DisplayId, DisplayNode, Entity, EntityId,
    NewArtwork, NewAsset, NewEntity, NewScene, Scene, SceneId,
};

/// Record storage used by the gallery and the session loops.
///
/// Lookups return `Ok(None)` for missing rows; callers decide whether that
/// is a not-found error. `insert_asset` must reject a digest that is already
/// stored with [`Error::Conflict`] so concurrent duplicate uploads resolve to
/// one row.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn asset_by_digest(&self, sha256: &str) -> Result<Option<Asset>>;
    async fn asset(&self, id: AssetId) -> Result<Option<Asset>>;
    async fn assets(&self) -> Result<Vec<Asset>>;
    async fn insert_asset(&self, asset: NewAsset) -> Result<Asset>;

    async fn insert_artwork(&self, artwork: NewArtwork) -> Result<Artwork>;
    async fn artwork(&self, id: ArtworkId) -> Result<Option<Artwork>>;
    async fn artwork_by_token(&self, token: &str) -> Result<Option<Artwork>>;
    async fn artworks(&self) -> Result<Vec<Artwork>>;
    async fn delete_artwork(&self, id: ArtworkId) -> Result<Option<Artwork>>;

    async fn insert_scene(&self, scene: NewScene) -> Result<Scene>;
    async fn scene(&self, id: SceneId) -> Result<Option<Scene>>;
    async fn scenes(&self) -> Result<Vec<Scene>>;

    async fn insert_entity(&self, entity: NewEntity) -> Result<Entity>;
    async fn entities_in_scene(&self, scene_id: SceneId) -> Result<Vec<Entity>>;
    /// Deletes every entity of the scene and returns how many were removed.
    async fn reset_scene(&self, scene_id: SceneId) -> Result<usize>;
    /// Deletes the artwork's entities and returns the scenes they were in.
    async fn delete_entities_for_artwork(&self, artwork_id: ArtworkId) -> Result<Vec<SceneId>>;

    async fn bind_display(
        &self,
        device_key: &str,
        scene_id: SceneId,
        caps: DisplayCaps,
    ) -> Result<DisplayNode>;
    async fn display_by_key(&self, device_key: &str) -> Result<Option<DisplayNode>>;
    async fn displays_in_scene(&self, scene_id: SceneId) -> Result<Vec<DisplayNode>>;
}

#[derive(Default)]
struct Tables {
    assets: BTreeMap<AssetId, Asset>,
    digests: HashMap<String, AssetId>,
    artworks: BTreeMap<ArtworkId, Artwork>,
    tokens: HashMap<String, ArtworkId>,
    scenes: BTreeMap<SceneId, Scene>,
    entities: BTreeMap<EntityId, Entity>,
    displays: BTreeMap<DisplayId, DisplayNode>,
    device_keys: HashMap<String, DisplayId>,
    last_id: u64,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }
}

/// In-process catalog. Ids come from one counter shared by all tables.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn asset_by_digest(&self, sha256: &str) -> Result<Option<Asset>> {
        let tables = self.tables.read().await;
        Ok(tables
            .digests
            .get(sha256)
            .and_then(|id| tables.assets.get(id))
            .cloned())
    }

    async fn asset(&self, id: AssetId) -> Result<Option<Asset>> {
        Ok(self.tables.read().await.assets.get(&id).cloned())
    }

    async fn assets(&self) -> Result<Vec<Asset>> {
        Ok(self.tables.read().await.assets.values().cloned().collect())
    }

    async fn insert_asset(&self, asset: NewAsset) -> Result<Asset> {
        let mut tables = self.tables.write().await;
        if tables.digests.contains_key(&asset.sha256) {
            return Err(Error::Conflict(format!("asset {}", asset.sha256)));
        }
        let id = tables.next_id();
        let stored = Asset {
            id,
            path: asset.path,
            thumb_path: asset.thumb_path,
            mime: asset.mime,
            width: asset.width,
            height: asset.height,
            bytes: asset.bytes,
            sha256: asset.sha256,
            created_at: Utc::now(),
        };
        tables.digests.insert(stored.sha256.clone(), id);
        tables.assets.insert(id, stored.clone());
        Ok(stored)
    }

    async fn insert_artwork(&self, artwork: NewArtwork) -> Result<Artwork> {
        let mut tables = self.tables.write().await;
        if !tables.assets.contains_key(&artwork.asset_id) {
            return Err(Error::not_found(format!("asset {}", artwork.asset_id)));
        }
        if tables.tokens.contains_key(&artwork.token) {
            return Err(Error::Conflict("artwork token".into()));
        }
        let id = tables.next_id();
        let stored = Artwork {
            id,
            asset_id: artwork.asset_id,
            title: artwork.title,
            tags: artwork.tags,
            token: artwork.token,
            created_at: Utc::now(),
        };
        tables.tokens.insert(stored.token.clone(), id);
        tables.artworks.insert(id, stored.clone());
        Ok(stored)
    }

    async fn artwork(&self, id: ArtworkId) -> Result<Option<Artwork>> {
        Ok(self.tables.read().await.artworks.get(&id).cloned())
    }

    async fn artwork_by_token(&self, token: &str) -> Result<Option<Artwork>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tokens
            .get(token)
            .and_then(|id| tables.artworks.get(id))
            .cloned())
    }

    async fn artworks(&self) -> Result<Vec<Artwork>> {
        Ok(self.tables.read().await.artworks.values().cloned().collect())
    }

    async fn delete_artwork(&self, id: ArtworkId) -> Result<Option<Artwork>> {
        let mut tables = self.tables.write().await;
        let removed = tables.artworks.remove(&id);
        if let Some(artwork) = &removed {
            tables.tokens.remove(&artwork.token);
        }
        Ok(removed)
    }

    async fn insert_scene(&self, scene: NewScene) -> Result<Scene> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let stored = Scene {
            id,
            name: scene.name,
            width: scene.width,
            height: scene.height,
            created_at: Utc::now(),
        };
        tables.scenes.insert(id, stored.clone());
        Ok(stored)
    }

    async fn scene(&self, id: SceneId) -> Result<Option<Scene>> {
        Ok(self.tables.read().await.scenes.get(&id).cloned())
    }

    async fn scenes(&self) -> Result<Vec<Scene>> {
        Ok(self.tables.read().await.scenes.values().cloned().collect())
    }

    async fn insert_entity(&self, entity: NewEntity) -> Result<Entity> {
        let mut tables = self.tables.write().await;
        if !tables.scenes.contains_key(&entity.scene_id) {
            return Err(Error::not_found(format!("scene {}", entity.scene_id)));
        }
        if !tables.artworks.contains_key(&entity.artwork_id) {
            return Err(Error::not_found(format!("artwork {}", entity.artwork_id)));
        }
        let id = tables.next_id();
        let stored = Entity {
            id,
            scene_id: entity.scene_id,
            artwork_id: entity.artwork_id,
            placement: entity.placement,
            created_at: Utc::now(),
        };
        tables.entities.insert(id, stored.clone());
        Ok(stored)
    }

    async fn entities_in_scene(&self, scene_id: SceneId) -> Result<Vec<Entity>> {
        Ok(self
            .tables
            .read()
            .await
            .entities
            .values()
            .filter(|entity| entity.scene_id == scene_id)
            .cloned()
            .collect())
    }

    async fn reset_scene(&self, scene_id: SceneId) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let before = tables.entities.len();
        tables.entities.retain(|_, entity| entity.scene_id != scene_id);
        Ok(before - tables.entities.len())
    }

    async fn delete_entities_for_artwork(&self, artwork_id: ArtworkId) -> Result<Vec<SceneId>> {
        let mut tables = self.tables.write().await;
        let mut scenes = BTreeSet::new();
        tables.entities.retain(|_, entity| {
            if entity.artwork_id == artwork_id {
                scenes.insert(entity.scene_id);
                false
            } else {
                true
            }
        });
        Ok(scenes.into_iter().collect())
    }

    async fn bind_display(
        &self,
        device_key: &str,
        scene_id: SceneId,
        caps: DisplayCaps,
    ) -> Result<DisplayNode> {
        let mut tables = self.tables.write().await;
        if !tables.scenes.contains_key(&scene_id) {
            return Err(Error::not_found(format!("scene {scene_id}")));
        }
        let id = match tables.device_keys.get(device_key).copied() {
            Some(id) => id,
            None => {
                let id = tables.next_id();
                tables.device_keys.insert(device_key.to_string(), id);
                id
            }
        };
        let node = tables.displays.entry(id).or_insert_with(|| DisplayNode {
            id,
            scene_id,
            device_key: device_key.to_string(),
            viewport_w: 0,
            viewport_h: 0,
            pixel_width: 0,
            pixel_height: 0,
            px_ratio: 1.0,
            bound_at: Utc::now(),
        });
        node.scene_id = scene_id;
        node.bound_at = Utc::now();
        node.apply_caps(caps);
        Ok(node.clone())
    }

    async fn display_by_key(&self, device_key: &str) -> Result<Option<DisplayNode>> {
        let tables = self.tables.read().await;
        Ok(tables
            .device_keys
            .get(device_key)
            .and_then(|id| tables.displays.get(id))
            .cloned())
    }

    async fn displays_in_scene(&self, scene_id: SceneId) -> Result<Vec<DisplayNode>> {
        Ok(self
            .tables
            .read()
            .await
            .displays
            .values()
            .filter(|node| node.scene_id == scene_id)
            .cloned()
            .collect())
    }
}
