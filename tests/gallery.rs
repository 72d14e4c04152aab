use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use festival_wall::catalog::{Catalog, MemoryCatalog};
use festival_wall::gallery::{AddEntity, Gallery, GalleryOptions, UploadMeta};
use festival_wall::hub::{Hub, HubHandle, Outbound};
use festival_wall::imaging::TransformConfig;
use festival_wall::messages::ServerMessage;
use festival_wall::placement::{AnimationKind, PlacementOverrides};
use festival_wall::room::RoomId;
use festival_wall::session::SessionId;
use festival_wall::Error;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use tokio::sync::mpsc;

struct Fixture {
    root: PathBuf,
    catalog: Arc<MemoryCatalog>,
    hub: HubHandle,
    gallery: Gallery,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

async fn fixture() -> Fixture {
    let root = std::env::temp_dir().join(format!("festival-wall-gallery-{}", uuid::Uuid::new_v4()));
    let catalog = Arc::new(MemoryCatalog::new());
    let hub = Hub::spawn();
    let gallery = Gallery::open(
        GalleryOptions {
            asset_root: root.clone(),
            default_scene_width: 1920,
            default_scene_height: 1080,
            transform: TransformConfig::default(),
        },
        catalog.clone(),
        hub.clone(),
    )
    .await
    .unwrap();
    Fixture {
        root,
        catalog,
        hub,
        gallery,
    }
}

fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([shade, (x % 200) as u8, (y % 200) as u8]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn display(hub: &HubHandle, room: RoomId) -> mpsc::Receiver<Outbound> {
    let (tx, rx) = mpsc::channel(64);
    let id = SessionId::new();
    hub.register(id, tx);
    hub.join(id, room, Some(format!("test-{id}")));
    rx
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

#[tokio::test]
async fn duplicate_uploads_share_one_asset_but_get_their_own_artwork() {
    let fx = fixture().await;
    let scene = fx.gallery.default_scene();
    let mut rx = display(&fx.hub, RoomId::scene(scene));
    let bytes = png(800, 600, 42);

    let first = fx
        .gallery
        .upload(
            &bytes,
            UploadMeta {
                title: Some("Lanterns".into()),
                tags: vec!["night".into()],
            },
        )
        .await
        .unwrap();
    let second = fx.gallery.upload(&bytes, UploadMeta::default()).await.unwrap();
    fx.hub.stats().await;

    assert_eq!(fx.catalog.assets().await.unwrap().len(), 1);
    assert_eq!(fx.catalog.artworks().await.unwrap().len(), 2);
    assert_eq!(fx.catalog.entities_in_scene(scene).await.unwrap().len(), 2);
    assert_ne!(first.token, second.token);
    assert_eq!(first.asset_url, format!("/download/{}", first.token));

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    for (event, receipt) in events.iter().zip([&first, &second]) {
        assert_eq!(event["type"], "entity.add");
        assert_eq!(event["data"]["entity_id"], receipt.entity.id);
        assert_eq!(event["data"]["artwork_url"], receipt.asset_url.as_str());
    }
    // Consecutive uploads walk the animation rotation.
    assert_eq!(first.entity.placement.animation_kind, AnimationKind::Pulsate);
    assert_eq!(second.entity.placement.animation_kind, AnimationKind::Disperse);
}

#[tokio::test]
async fn placements_stay_inside_the_scene() {
    let fx = fixture().await;
    for shade in 0..10 {
        let receipt = fx.gallery.upload(&png(32, 32, shade), UploadMeta::default()).await.unwrap();
        let init = receipt.entity.placement.init;
        assert!((100.0..=1820.0).contains(&init.x), "x = {}", init.x);
        assert!((100.0..=980.0).contains(&init.y), "y = {}", init.y);
        assert!(init.vx.abs() <= 2.0 && init.vy.abs() <= 2.0);
        assert_eq!((init.angle, init.scale), (0.0, 1.0));
    }
}

#[tokio::test]
async fn reset_clears_one_scene_and_notifies_only_its_room() {
    let fx = fixture().await;
    let main = fx.gallery.default_scene();
    let other = fx.gallery.create_scene("lobby", 1280, 720).await.unwrap();
    for shade in 0..5 {
        fx.gallery.upload(&png(16, 16, shade), UploadMeta::default()).await.unwrap();
    }
    let artwork = fx.catalog.artworks().await.unwrap()[0].id;
    fx.gallery
        .place_entity(
            other.id,
            AddEntity {
                artwork_id: artwork,
                overrides: PlacementOverrides::default(),
            },
        )
        .await
        .unwrap();

    let mut main_rx = display(&fx.hub, RoomId::scene(main));
    let mut other_rx = display(&fx.hub, RoomId::scene(other.id));

    let removed = fx.gallery.reset_scene(main).await.unwrap();
    fx.hub.stats().await;

    assert_eq!(removed, 5);
    assert!(fx.catalog.entities_in_scene(main).await.unwrap().is_empty());
    assert_eq!(fx.catalog.entities_in_scene(other.id).await.unwrap().len(), 1);
    assert_eq!(
        drain(&mut main_rx),
        vec![serde_json::to_value(ServerMessage::SceneReset { hard: true }).unwrap()]
    );
    assert!(drain(&mut other_rx).is_empty());

    let err = fx.gallery.reset_scene(999).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn manual_placement_honours_overrides() {
    let fx = fixture().await;
    let receipt = fx.gallery.upload(&png(20, 20, 1), UploadMeta::default()).await.unwrap();
    let scene = fx.gallery.default_scene();
    let mut rx = display(&fx.hub, RoomId::scene(scene));

    let entity = fx
        .gallery
        .place_entity(
            scene,
            AddEntity {
                artwork_id: receipt.artwork_id,
                overrides: PlacementOverrides {
                    x: Some(10.0),
                    y: Some(20.0),
                    animation_kind: Some(AnimationKind::Explode),
                    ..PlacementOverrides::default()
                },
            },
        )
        .await
        .unwrap();
    fx.hub.stats().await;

    assert_eq!((entity.placement.init.x, entity.placement.init.y), (10.0, 20.0));
    assert_eq!(entity.placement.animation_kind, AnimationKind::Explode);
    assert_eq!(drain(&mut rx).len(), 1);

    let missing = fx
        .gallery
        .place_entity(
            scene,
            AddEntity {
                artwork_id: 4242,
                overrides: PlacementOverrides::default(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(missing, Error::NotFound(_)));
}

#[tokio::test]
async fn downloads_resolve_tokens_to_files() {
    let fx = fixture().await;
    let receipt = fx.gallery.upload(&png(1500, 900, 7), UploadMeta::default()).await.unwrap();

    let full = fx.gallery.download(&receipt.token, false).await.unwrap();
    let thumb = fx.gallery.download(&receipt.token, true).await.unwrap();
    assert_eq!(full.mime, "image/png");
    assert_ne!(full.path, thumb.path);
    let stored = image::open(&full.path).unwrap();
    assert_eq!((stored.width(), stored.height()), (1024, 614));
    let small = image::open(&thumb.path).unwrap();
    assert_eq!((small.width(), small.height()), (512, 307));

    let err = fx.gallery.download("no-such-token", false).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn failed_uploads_leave_no_rows_and_no_events() {
    let fx = fixture().await;
    let mut rx = display(&fx.hub, RoomId::scene(fx.gallery.default_scene()));

    let err = fx
        .gallery
        .upload(b"plain text pretending to be a photo", UploadMeta::default())
        .await
        .unwrap_err();
    fx.hub.stats().await;

    assert!(matches!(err, Error::Decode(_)), "{err:?}");
    assert!(fx.catalog.assets().await.unwrap().is_empty());
    assert!(fx.catalog.artworks().await.unwrap().is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn deleting_an_artwork_retracts_its_entities() {
    let fx = fixture().await;
    let scene = fx.gallery.default_scene();
    let receipt = fx.gallery.upload(&png(24, 24, 9), UploadMeta::default()).await.unwrap();
    let mut rx = display(&fx.hub, RoomId::scene(scene));

    fx.gallery.delete_artwork(receipt.artwork_id).await.unwrap();
    fx.hub.stats().await;

    assert!(fx.catalog.entities_in_scene(scene).await.unwrap().is_empty());
    assert_eq!(fx.catalog.assets().await.unwrap().len(), 1);
    assert_eq!(
        drain(&mut rx),
        vec![serde_json::json!({ "type": "entity.delete", "data": { "artwork_id": receipt.artwork_id } })]
    );
    assert!(matches!(
        fx.gallery.delete_artwork(receipt.artwork_id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn placements_racing_a_delete_leave_no_dangling_entities() {
    let fx = fixture().await;
    let scene = fx.gallery.default_scene();
    let receipt = fx.gallery.upload(&png(24, 24, 11), UploadMeta::default()).await.unwrap();
    let place = || {
        fx.gallery.place_entity(
            scene,
            AddEntity {
                artwork_id: receipt.artwork_id,
                overrides: PlacementOverrides::default(),
            },
        )
    };

    let placements = futures_util::future::join_all((0..32).map(|_| place()));
    let (placed, deleted) = tokio::join!(placements, fx.gallery.delete_artwork(receipt.artwork_id));

    deleted.unwrap();
    for result in placed {
        if let Err(err) = result {
            assert!(matches!(err, Error::NotFound(_)), "{err:?}");
        }
    }
    assert!(fx.catalog.artwork(receipt.artwork_id).await.unwrap().is_none());
    assert!(fx
        .catalog
        .entities_in_scene(scene)
        .await
        .unwrap()
        .iter()
        .all(|entity| entity.artwork_id != receipt.artwork_id));
}

#[tokio::test]
async fn scene_detail_lists_entities_and_bound_displays() {
    let fx = fixture().await;
    let scene = fx.gallery.default_scene();
    fx.gallery.upload(&png(24, 24, 3), UploadMeta::default()).await.unwrap();
    fx.catalog
        .bind_display(
            "wall-left",
            scene,
            festival_wall::models::DisplayCaps {
                w: 1280,
                h: 720,
                px_ratio: 2.0,
            },
        )
        .await
        .unwrap();

    let detail = fx.gallery.scene(scene).await.unwrap();
    assert_eq!(detail.entities.len(), 1);
    assert_eq!(detail.displays.len(), 1);
    assert_eq!(detail.displays[0].pixel_width, 2560);

    assert!(matches!(
        fx.gallery.create_scene("   ", 10, 10).await,
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        fx.gallery.create_scene("empty", 0, 10).await,
        Err(Error::Invalid(_))
    ));
}
