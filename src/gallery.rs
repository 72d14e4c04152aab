//! Orchestration over the catalog, the asset store and the hub.
//!
//! Every mutation here commits to the catalog first and broadcasts after, so
//! displays never hear about an entity that does not exist.

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::assets::AssetStore;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::hub::HubHandle;
use crate::imaging::{ImageTransform, TransformConfig};
use crate::messages::ServerMessage;
use crate::models::{
    Artwork, ArtworkId, DisplayNode, Entity, NewArtwork, NewEntity, NewScene, Scene, SceneId,
};
use crate::placement::{AnimationRotation, PlacementGenerator, PlacementOverrides};
use crate::room::RoomId;

const TOKEN_BYTES: usize = 24;
pub const DEFAULT_SCENE_NAME: &str = "main";

#[derive(Debug, Clone)]
pub struct GalleryOptions {
    pub asset_root: PathBuf,
    pub default_scene_width: u32,
    pub default_scene_height: u32,
    pub transform: TransformConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadMeta {
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub artwork_id: ArtworkId,
    pub token: String,
    pub asset_url: String,
    pub thumb_url: String,
    pub entity: Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddEntity {
    pub artwork_id: ArtworkId,
    #[serde(flatten)]
    pub overrides: PlacementOverrides,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub mime: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SceneDetail {
    #[serde(flatten)]
    pub scene: Scene,
    pub entities: Vec<Entity>,
    pub displays: Vec<DisplayNode>,
}

pub struct Gallery {
    catalog: Arc<dyn Catalog>,
    assets: AssetStore,
    placement: PlacementGenerator,
    hub: HubHandle,
    default_scene: SceneId,
}

impl Gallery {
    pub async fn open(options: GalleryOptions, catalog: Arc<dyn Catalog>, hub: HubHandle) -> Result<Self> {
        let assets = AssetStore::new(
            options.asset_root,
            Arc::clone(&catalog),
            ImageTransform::new(options.transform),
        )
        .await?;
        let scene = ensure_default_scene(
            catalog.as_ref(),
            options.default_scene_width,
            options.default_scene_height,
        )
        .await?;
        info!(
            "uploads land in scene {} ({}x{})",
            scene.id, scene.width, scene.height
        );
        Ok(Gallery {
            catalog,
            assets,
            placement: PlacementGenerator::new(Arc::new(AnimationRotation::new())),
            hub,
            default_scene: scene.id,
        })
    }

    pub fn catalog(&self) -> Arc<dyn Catalog> {
        Arc::clone(&self.catalog)
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn default_scene(&self) -> SceneId {
        self.default_scene
    }

    /// Ingests an image and places it in the default scene.
    pub async fn upload(&self, bytes: &[u8], meta: UploadMeta) -> Result<UploadReceipt> {
        let scene = self.require_scene(self.default_scene).await?;
        let asset = self.assets.resolve(bytes).await?;
        let artwork = self
            .catalog
            .insert_artwork(NewArtwork {
                asset_id: asset.id,
                title: meta.title.filter(|title| !title.trim().is_empty()),
                tags: meta.tags,
                token: new_token(),
            })
            .await?;

        let placement = self.placement.place(scene.width, scene.height);
        let entity = match self
            .catalog
            .insert_entity(NewEntity {
                scene_id: scene.id,
                artwork_id: artwork.id,
                placement,
            })
            .await
        {
            Ok(entity) => entity,
            Err(err) => {
                if let Err(cleanup) = self.catalog.delete_artwork(artwork.id).await {
                    warn!("artwork {} left behind after failed placement: {cleanup}", artwork.id);
                }
                return Err(err);
            }
        };

        self.announce(&entity, &artwork);
        info!(
            "artwork {} (asset {}) placed as entity {} in scene {}",
            artwork.id, asset.id, entity.id, scene.id
        );
        Ok(UploadReceipt {
            artwork_id: artwork.id,
            asset_url: download_url(&artwork.token, false),
            thumb_url: download_url(&artwork.token, true),
            token: artwork.token,
            entity,
        })
    }

    /// Places an existing artwork, with optional fixed values.
    pub async fn place_entity(&self, scene_id: SceneId, request: AddEntity) -> Result<Entity> {
        let scene = self.require_scene(scene_id).await?;
        let artwork = self
            .catalog
            .artwork(request.artwork_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("artwork {}", request.artwork_id)))?;

        let placement = self.placement.place_with(
            &mut rand::thread_rng(),
            scene.width,
            scene.height,
            &request.overrides,
        );
        let entity = self
            .catalog
            .insert_entity(NewEntity {
                scene_id: scene.id,
                artwork_id: artwork.id,
                placement,
            })
            .await?;
        self.announce(&entity, &artwork);
        Ok(entity)
    }

    /// Clears a scene and tells its displays to drop everything.
    pub async fn reset_scene(&self, scene_id: SceneId) -> Result<usize> {
        let scene = self.require_scene(scene_id).await?;
        let removed = self.catalog.reset_scene(scene.id).await?;
        self.hub
            .broadcast(RoomId::scene(scene.id), &ServerMessage::SceneReset { hard: true });
        info!("scene {} reset, {removed} entities removed", scene.id);
        Ok(removed)
    }

    pub async fn download(&self, token: &str, thumb: bool) -> Result<Download> {
        let artwork = self
            .catalog
            .artwork_by_token(token)
            .await?
            .ok_or_else(|| Error::not_found("artwork"))?;
        let asset = self
            .catalog
            .asset(artwork.asset_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("asset {}", artwork.asset_id)))?;

        let relative = if thumb { &asset.thumb_path } else { &asset.path };
        let path = self.assets.absolute(relative);
        if !fs::try_exists(&path).await? {
            warn!("asset {} is missing {}", asset.id, path.display());
            return Err(Error::not_found("file"));
        }
        Ok(Download {
            path,
            mime: asset.mime,
        })
    }

    pub async fn create_scene(&self, name: &str, width: u32, height: u32) -> Result<Scene> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Invalid("scene name is empty".into()));
        }
        if width == 0 || height == 0 {
            return Err(Error::Invalid(format!("scene size {width}x{height} is empty")));
        }
        let scene = self
            .catalog
            .insert_scene(NewScene {
                name: name.to_string(),
                width,
                height,
            })
            .await?;
        info!("created scene {} {:?}", scene.id, scene.name);
        Ok(scene)
    }

    pub async fn scene(&self, scene_id: SceneId) -> Result<SceneDetail> {
        let scene = self.require_scene(scene_id).await?;
        Ok(SceneDetail {
            entities: self.catalog.entities_in_scene(scene.id).await?,
            displays: self.catalog.displays_in_scene(scene.id).await?,
            scene,
        })
    }

    pub async fn scenes(&self) -> Result<Vec<Scene>> {
        self.catalog.scenes().await
    }

    pub async fn artworks(&self) -> Result<Vec<Artwork>> {
        self.catalog.artworks().await
    }

    pub async fn artwork(&self, id: ArtworkId) -> Result<Artwork> {
        self.catalog
            .artwork(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("artwork {id}")))
    }

    /// Removes an artwork and every entity showing it. The asset stays.
    pub async fn delete_artwork(&self, id: ArtworkId) -> Result<()> {
        // Artwork first: entity inserts check it exists, so none can slip in after.
        if self.catalog.delete_artwork(id).await?.is_none() {
            return Err(Error::not_found(format!("artwork {id}")));
        }
        let scenes = self.catalog.delete_entities_for_artwork(id).await?;
        for scene_id in &scenes {
            self.hub.broadcast(
                RoomId::scene(*scene_id),
                &ServerMessage::EntityDelete { artwork_id: id },
            );
        }
        info!("artwork {id} deleted from {} scenes", scenes.len());
        Ok(())
    }

    fn announce(&self, entity: &Entity, artwork: &Artwork) {
        self.hub.broadcast(
            RoomId::scene(entity.scene_id),
            &ServerMessage::entity_add(entity, download_url(&artwork.token, false)),
        );
    }

    async fn require_scene(&self, id: SceneId) -> Result<Scene> {
        self.catalog
            .scene(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("scene {id}")))
    }
}

/// Returns the oldest scene, creating one when the catalog has none.
pub async fn ensure_default_scene(catalog: &dyn Catalog, width: u32, height: u32) -> Result<Scene> {
    if let Some(scene) = catalog.scenes().await?.into_iter().min_by_key(|scene| scene.id) {
        return Ok(scene);
    }
    catalog
        .insert_scene(NewScene {
            name: DEFAULT_SCENE_NAME.to_string(),
            width,
            height,
        })
        .await
}

pub fn download_url(token: &str, thumb: bool) -> String {
    if thumb {
        format!("/download/{token}?thumb=true")
    } else {
        format!("/download/{token}")
    }
}

/// Splits a comma-separated tag list.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
