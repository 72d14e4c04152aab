use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::gallery::GalleryOptions;
use crate::imaging::TransformConfig;
use crate::session::SessionConfig;

/// Scene server for festival display walls.
#[derive(Debug, Clone, Parser)]
#[command(name = "festival-wall", version)]
pub struct Config {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Root of the content-addressed image store.
    #[arg(long, env = "ASSET_DIR", default_value = "./data/assets")]
    pub asset_dir: PathBuf,

    /// Static files for the display and upload pages.
    #[arg(long, env = "PUBLIC_DIR")]
    pub public_dir: Option<PathBuf>,

    #[arg(long, env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,
    #[arg(long, env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "DEFAULT_SCENE_WIDTH", default_value_t = 1920)]
    pub default_scene_width: u32,
    #[arg(long, env = "DEFAULT_SCENE_HEIGHT", default_value_t = 1080)]
    pub default_scene_height: u32,

    /// Messages a display may lag behind before it is disconnected.
    #[arg(long, env = "OUTBOUND_QUEUE", default_value_t = 256)]
    pub outbound_queue: usize,
    #[arg(long, env = "PING_INTERVAL_SECS", default_value_t = 54)]
    pub ping_interval_secs: u64,
    #[arg(long, env = "PONG_TIMEOUT_SECS", default_value_t = 60)]
    pub pong_timeout_secs: u64,
    #[arg(long, env = "WRITE_TIMEOUT_SECS", default_value_t = 10)]
    pub write_timeout_secs: u64,
    /// Largest inbound websocket message accepted.
    #[arg(long, env = "MAX_MESSAGE_BYTES", default_value_t = 512)]
    pub max_message_bytes: usize,
    /// Coalesce queued events into newline-separated frames.
    #[arg(long, env = "BATCH_FRAMES")]
    pub batch_frames: bool,

    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 20 * 1024 * 1024)]
    pub max_upload_bytes: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval_secs == 0 || self.ping_interval_secs >= self.pong_timeout_secs {
            return Err(Error::Invalid(format!(
                "ping interval ({}s) must be non-zero and shorter than the pong timeout ({}s)",
                self.ping_interval_secs, self.pong_timeout_secs
            )));
        }
        if self.default_scene_width == 0 || self.default_scene_height == 0 {
            return Err(Error::Invalid("default scene size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            outbound_capacity: self.outbound_queue.max(1),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            max_message_bytes: self.max_message_bytes,
            batch_frames: self.batch_frames,
        }
    }

    pub fn gallery(&self) -> GalleryOptions {
        GalleryOptions {
            asset_root: self.asset_dir.clone(),
            default_scene_width: self.default_scene_width,
            default_scene_height: self.default_scene_height,
            transform: TransformConfig::default(),
        }
    }

    /// Certificate and key, when both are configured and present on disk.
    pub fn tls_files(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) if cert.is_file() && key.is_file() => {
                Some((cert.clone(), key.clone()))
            }
            _ => None,
        }
    }
}
