use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use festival_wall::catalog::MemoryCatalog;
use festival_wall::config::Config;
use festival_wall::gallery::Gallery;
use festival_wall::hub::Hub;
use festival_wall::routes::routes;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    if let Err(err) = config.validate() {
        error!("{err}");
        return ExitCode::FAILURE;
    }

    let hub = Hub::spawn();
    let gallery = match Gallery::open(config.gallery(), Arc::new(MemoryCatalog::new()), hub).await {
        Ok(gallery) => Arc::new(gallery),
        Err(err) => {
            error!("failed to open the gallery at {}: {err}", config.asset_dir.display());
            return ExitCode::FAILURE;
        }
    };

    let routes = routes(gallery, &config);
    match config.tls_files() {
        Some((cert, key)) => {
            info!("serving https/wss on {}", config.bind);
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(config.bind)
                .await;
        }
        None => {
            if config.tls_cert.is_some() || config.tls_key.is_some() {
                warn!("TLS certificate or key missing, falling back to plain http/ws");
            }
            info!("serving http/ws on {}", config.bind);
            warp::serve(routes).run(config.bind).await;
        }
    }
    ExitCode::SUCCESS
}
