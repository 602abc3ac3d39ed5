use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use warp::Filter;

use talkroom::config::Config;
use talkroom::crypto::StorageCrypto;
use talkroom::db::ChatDb;
use talkroom::media::{self, MediaStore};
use talkroom::presence::PresenceManager;
use talkroom::server::ChatServer;
use talkroom::sweeper;
use talkroom::translate::{MyMemory, TranslationService};

fn tls_available(cert_path: &Path, key_path: &Path) -> bool {
    let Ok(cert_file) = File::open(cert_path) else {
        return false;
    };
    let Ok(key_file) = File::open(key_path) else {
        return false;
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .filter_map(Result::ok)
        .collect();
    if certs.is_empty() {
        warn!("no certificates in {}, staying on plaintext", cert_path.display());
        return false;
    }
    match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
        Ok(Some(_)) => true,
        _ => {
            warn!("no usable private key in {}, staying on plaintext", key_path.display());
            false
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Config::from_env();

    let crypto = match StorageCrypto::load_or_generate(&config.secret_path()) {
        Ok(crypto) => Arc::new(crypto),
        Err(e) => {
            error!("cannot initialize the encryption key: {e}");
            std::process::exit(1);
        }
    };

    let db = Arc::new(ChatDb::open(config.document_path(), crypto.clone()).await);
    let presence = Arc::new(PresenceManager::new(config.grace_period));
    let media_store =
        match MediaStore::new(config.upload_dir(), crypto, config.max_upload_bytes) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("cannot prepare the upload directory: {e}");
                std::process::exit(1);
            }
        };
    let translator = Arc::new(TranslationService::new(Arc::new(MyMemory::new())));

    let server = Arc::new(ChatServer::new(
        db.clone(),
        presence.clone(),
        media_store.clone(),
        translator,
        config.retention_hours,
    ));

    sweeper::spawn(
        db,
        media_store.clone(),
        config.sweep_interval,
        config.default_retention_ms(),
    );

    let ws_server = server.clone();
    let ws_route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
        let server = ws_server.clone();
        ws.on_upgrade(move |socket| async move {
            server.handle_connection(socket).await;
        })
    });

    let upload_store = media_store.clone();
    let upload_route = warp::path!("api" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length(config.max_upload_bytes as u64 + 16 * 1024))
        .and_then(move |form| media::handle_upload(form, upload_store.clone()));

    let fetch_store = media_store.clone();
    let file_route = warp::path!("api" / "file" / String)
        .and(warp::get())
        .and(warp::header::optional::<String>("range"))
        .and_then(move |name, range| media::handle_fetch(name, range, fetch_store.clone()));

    let stats_presence = presence.clone();
    let stats_route = warp::path!("api" / "stats").and(warp::get()).and_then(move || {
        let presence = stats_presence.clone();
        async move {
            let (rooms, users) = presence.stats().await;
            Ok::<_, warp::Rejection>(warp::reply::json(
                &serde_json::json!({ "rooms": rooms, "users": users }),
            ))
        }
    });

    let routes = ws_route
        .or(upload_route)
        .or(file_route)
        .or(stats_route)
        .with(warp::cors().allow_any_origin());

    let addr = ([0, 0, 0, 0], config.port);
    if tls_available(&config.tls_cert, &config.tls_key) {
        info!("starting secure server (wss) on port {}", config.port);
        warp::serve(routes)
            .tls()
            .cert_path(&config.tls_cert)
            .key_path(&config.tls_key)
            .run(addr)
            .await;
    } else {
        info!("TLS material not found, serving plaintext on port {}", config.port);
        warp::serve(routes).run(addr).await;
    }
}
