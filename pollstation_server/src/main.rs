#[macro_use]
extern crate rocket;

#[macro_use]
extern crate serde;

mod config;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use pollstation::crypto::MainKey;
use pollstation::keystore::{FsKeyStore, KeyStore, MemoryKeyStore};
use pollstation::{Backend, Decrypt, MemoryBackend, MemoryConfig, VoteService};

use config::Config;
use routes::App;

fn build_backend(name: &str) -> Box<dyn Backend> {
    match name {
        "memory" => Box::new(MemoryBackend::default()),
        other => panic!("unknown backend {}", other),
    }
}

#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let main_key = match &config.main_key {
        Some(bytes) => MainKey::from_bytes(bytes).expect("VOTE_MAIN_KEY is not a valid key"),
        None => {
            warn!("VOTE_MAIN_KEY is not set, using a volatile signing key");
            MainKey::generate()
        }
    };

    let key_store: Box<dyn KeyStore> = match &config.keystore_path {
        Some(path) => {
            info!("key store: {}", path);
            Box::new(FsKeyStore::new(path))
        }
        None => {
            info!("key store: memory");
            Box::new(MemoryKeyStore::default())
        }
    };

    let decrypter = Decrypt::with_options(
        main_key,
        key_store,
        config.decrypt_workers,
        config.max_votes,
    );

    // The production config source is the external fetcher; this binary
    // wires the in-memory source for development setups.
    let source = Arc::new(MemoryConfig::new(&config.organization_url));

    let service = VoteService::new(
        build_backend(&config.backend_fast),
        build_backend(&config.backend_long),
        source,
        Some(Arc::new(decrypter)),
    );

    let app = App {
        service,
        long_poll: Duration::from_secs(config.long_poll_secs),
    };

    info!("listen on :{}", config.port);
    let figment = rocket::Config::figment()
        .merge(("port", config.port))
        .merge(("address", "0.0.0.0"));

    let _ = rocket::custom(figment)
        .manage(app)
        .mount(
            "/",
            routes![
                routes::start,
                routes::stop,
                routes::clear,
                routes::clear_all,
                routes::vote,
                routes::voted,
                routes::vote_count,
                routes::health,
            ],
        )
        .launch()
        .await?;

    Ok(())
}
