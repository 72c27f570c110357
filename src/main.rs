// EmberDB server entry point.
//
// Configuration-file parsing lives outside the core; the binary reads
// a handful of environment overrides on top of the defaults and one
// built-in demo space, which is enough to bring a node up standalone
// or as a replica.

use std::path::PathBuf;

use tokio::task::LocalSet;
use tracing::info;

use emberdb::config::{Config, IndexConfig, IndexStructure, KeyType, SpaceConfig};
use emberdb::server::Server;
use emberdb::VERSION;

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn build_config() -> Config {
    let mut cfg = Config::default();
    cfg.listen_port = env_port("EMBERDB_LISTEN_PORT", cfg.listen_port);
    cfg.admin_port = env_port("EMBERDB_ADMIN_PORT", cfg.admin_port);
    cfg.replication_port = env_port("EMBERDB_REPLICATION_PORT", cfg.replication_port);
    cfg.replication_source = std::env::var("EMBERDB_REPLICATION_SOURCE").ok();
    if let Ok(dir) = std::env::var("EMBERDB_WAL_DIR") {
        cfg.wal_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("EMBERDB_SNAP_DIR") {
        cfg.snap_dir = PathBuf::from(dir);
    }

    cfg.spaces.push(SpaceConfig {
        id: 0,
        enabled: true,
        cardinality: 0,
        indexes: vec![IndexConfig {
            key_field: 0,
            key_type: KeyType::Num,
            unique: true,
            structure: IndexStructure::Hash,
        }],
    });
    cfg
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!(version = VERSION, "starting EmberDB");

    // Single-threaded core: one scheduler thread runs every fiber.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let code = runtime.block_on(async {
        let local = LocalSet::new();
        local
            .run_until(async {
                let server = Server::new(build_config());
                server.run().await
            })
            .await
    });
    std::process::exit(code);
}
