//! HTTP and websocket surface.

use std::convert::Infallible;
use std::sync::Arc;

use futures_util::TryStreamExt;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::json;
use warp::filters::multipart::{FormData, Part};
use warp::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::ws::Ws;
use warp::{Buf, Filter, Rejection, Reply};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gallery::{parse_tags, AddEntity, Gallery, UploadMeta};
use crate::models::{ArtworkId, SceneId};
use crate::session::{self, SessionContext};

const JSON_BODY_LIMIT: u64 = 64 * 1024;

#[derive(Debug, Deserialize)]
struct CreateScene {
    name: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    thumb: bool,
}

#[derive(Debug, Serialize)]
struct ResetReceipt {
    scene_id: SceneId,
    removed: usize,
}

/// Every route the server answers, with CORS and request logging applied.
pub fn routes(
    gallery: Arc<Gallery>,
    config: &Config,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let session_ctx = SessionContext {
        hub: gallery.hub().clone(),
        catalog: gallery.catalog(),
        config: config.session(),
    };

    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::any().map(move || session_ctx.clone()))
        .map(|ws: Ws, ctx: SessionContext| {
            ws.max_message_size(ctx.config.max_message_bytes)
                .on_upgrade(move |socket| session::serve(socket, ctx))
                .into_response()
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_gallery(&gallery))
        .then(health);

    let upload = warp::path!("api" / "artworks")
        .and(warp::post())
        .and(warp::multipart::form().max_length(config.max_upload_bytes))
        .and(with_gallery(&gallery))
        .then(upload);

    let list_artworks = warp::path!("api" / "artworks")
        .and(warp::get())
        .and(with_gallery(&gallery))
        .then(|gallery: Arc<Gallery>| async move { respond(gallery.artworks().await, StatusCode::OK) });

    let get_artwork = warp::path!("api" / "artworks" / ArtworkId)
        .and(warp::get())
        .and(with_gallery(&gallery))
        .then(|id, gallery: Arc<Gallery>| async move { respond(gallery.artwork(id).await, StatusCode::OK) });

    let delete_artwork = warp::path!("api" / "artworks" / ArtworkId)
        .and(warp::delete())
        .and(with_gallery(&gallery))
        .then(|id, gallery: Arc<Gallery>| async move {
            match gallery.delete_artwork(id).await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(err) => error_response(&err),
            }
        });

    let create_scene = warp::path!("api" / "scenes")
        .and(warp::post())
        .and(json_body::<CreateScene>())
        .and(with_gallery(&gallery))
        .then(|body: CreateScene, gallery: Arc<Gallery>| async move {
            respond(
                gallery.create_scene(&body.name, body.width, body.height).await,
                StatusCode::CREATED,
            )
        });

    let list_scenes = warp::path!("api" / "scenes")
        .and(warp::get())
        .and(with_gallery(&gallery))
        .then(|gallery: Arc<Gallery>| async move { respond(gallery.scenes().await, StatusCode::OK) });

    let get_scene = warp::path!("api" / "scenes" / SceneId)
        .and(warp::get())
        .and(with_gallery(&gallery))
        .then(|id, gallery: Arc<Gallery>| async move { respond(gallery.scene(id).await, StatusCode::OK) });

    let add_entity = warp::path!("api" / "scenes" / SceneId / "entities")
        .and(warp::post())
        .and(json_body::<AddEntity>())
        .and(with_gallery(&gallery))
        .then(|id, body: AddEntity, gallery: Arc<Gallery>| async move {
            respond(gallery.place_entity(id, body).await, StatusCode::CREATED)
        });

    let reset_scene = warp::path!("api" / "scenes" / SceneId / "reset")
        .and(warp::post())
        .and(with_gallery(&gallery))
        .then(|scene_id, gallery: Arc<Gallery>| async move {
            let receipt = gallery
                .reset_scene(scene_id)
                .await
                .map(|removed| ResetReceipt { scene_id, removed });
            respond(receipt, StatusCode::OK)
        });

    let download = warp::path!("download" / String)
        .and(warp::get())
        .and(warp::query::<DownloadQuery>())
        .and(with_gallery(&gallery))
        .then(download);

    let api = upload
        .or(list_artworks)
        .unify()
        .or(get_artwork)
        .unify()
        .or(delete_artwork)
        .unify()
        .or(create_scene)
        .unify()
        .or(list_scenes)
        .unify()
        .or(get_scene)
        .unify()
        .or(add_entity)
        .unify()
        .or(reset_scene)
        .unify();

    let static_files = match config.public_dir.clone() {
        Some(dir) => warp::fs::dir(dir)
            .map(|file: warp::fs::File| file.into_response())
            .boxed(),
        None => warp::any()
            .and_then(|| async { Err::<Response, _>(warp::reject::not_found()) })
            .boxed(),
    };

    ws.or(health)
        .unify()
        .or(api)
        .unify()
        .or(download)
        .unify()
        .or(static_files)
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(["GET", "POST", "DELETE", "OPTIONS"])
                .allow_headers(["content-type"]),
        )
        .with(warp::log("festival_wall::http"))
}

fn with_gallery(
    gallery: &Arc<Gallery>,
) -> impl Filter<Extract = (Arc<Gallery>,), Error = Infallible> + Clone {
    let gallery = Arc::clone(gallery);
    warp::any().map(move || Arc::clone(&gallery))
}

fn json_body<T: serde::de::DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(JSON_BODY_LIMIT).and(warp::body::json())
}

async fn health(gallery: Arc<Gallery>) -> Response {
    let stats = gallery.hub().stats().await;
    reply::json(&json!({
        "status": "ok",
        "sessions": stats.sessions,
        "rooms": stats.rooms,
    }))
    .into_response()
}

struct UploadForm {
    image: Option<Vec<u8>>,
    meta: UploadMeta,
}

async fn upload(form: FormData, gallery: Arc<Gallery>) -> Response {
    let form = match read_upload_form(form).await {
        Ok(form) => form,
        Err(err) => return error_response(&err),
    };
    let Some(image) = form.image.filter(|image| !image.is_empty()) else {
        return error_response(&Error::Invalid("the image field is required".into()));
    };
    respond(gallery.upload(&image, form.meta).await, StatusCode::CREATED)
}

async fn read_upload_form(form: FormData) -> Result<UploadForm> {
    let mut parts = std::pin::pin!(form);
    let mut upload = UploadForm {
        image: None,
        meta: UploadMeta::default(),
    };
    while let Some(part) = parts
        .try_next()
        .await
        .map_err(|err| Error::Invalid(format!("malformed multipart body: {err}")))?
    {
        let name = part.name().to_string();
        let data = read_part(part).await?;
        match name.as_str() {
            "image" => upload.image = Some(data),
            "title" => upload.meta.title = Some(String::from_utf8_lossy(&data).trim().to_string()),
            "tags" => upload.meta.tags = parse_tags(&String::from_utf8_lossy(&data)),
            other => debug!("ignoring form field {other:?}"),
        }
    }
    Ok(upload)
}

async fn read_part(part: Part) -> Result<Vec<u8>> {
    part.stream()
        .try_fold(Vec::new(), |mut data, mut chunk| async move {
            while chunk.has_remaining() {
                let slice = chunk.chunk();
                let len = slice.len();
                data.extend_from_slice(slice);
                chunk.advance(len);
            }
            Ok(data)
        })
        .await
        .map_err(|err| Error::Invalid(format!("could not read form field: {err}")))
}

async fn download(token: String, query: DownloadQuery, gallery: Arc<Gallery>) -> Response {
    let file = match gallery.download(&token, query.thumb).await {
        Ok(file) => file,
        Err(err) => return error_response(&err),
    };
    let bytes = match tokio::fs::read(&file.path).await {
        Ok(bytes) => bytes,
        Err(err) => return error_response(&Error::from(err)),
    };
    warp::http::Response::builder()
        .header(CONTENT_TYPE, file.mime)
        .header(CACHE_CONTROL, "public, max-age=31536000, immutable")
        .body(bytes.into())
        .unwrap_or_else(|err| error_response(&Error::Storage(err.to_string())))
}

fn respond<T: Serialize>(result: Result<T>, success: StatusCode) -> Response {
    match result {
        Ok(body) => reply::with_status(reply::json(&body), success).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("request failed: {err}");
    } else {
        debug!("request rejected: {err}");
    }
    json_error(&err.to_string(), status)
}

fn json_error(message: &str, status: StatusCode) -> Response {
    reply::with_status(reply::json(&json!({ "error": message })), status).into_response()
}

async fn handle_rejection(rejection: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, err.to_string())
    } else if rejection.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "invalid query string".to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "payload too large".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        debug!("unhandled rejection: {rejection:?}");
        (StatusCode::BAD_REQUEST, "bad request".to_string())
    };
    Ok(json_error(&message, status))
}
