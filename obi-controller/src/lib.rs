#![deny(clippy::all)]

pub mod config;
pub mod errors;
pub mod routes;

use crate::config::Config;

use obi_judger::data::{ArchiveStore, ProblemStore};
use obi_judger::{JudgeEngine, Registry};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

pub struct App {
    pub engine: Arc<JudgeEngine>,
}

impl App {
    pub fn new(engine: Arc<JudgeEngine>) -> Self {
        Self { engine }
    }
}

#[tracing::instrument(err, skip(config))]
fn open_engine(config: &Config) -> Result<Arc<JudgeEngine>> {
    let database = &config.database;
    info!("opening database {}", database.path.display());
    let store: Arc<dyn ProblemStore> = Arc::new(ArchiveStore::open(
        &database.path,
        database.password.as_deref(),
    )?);

    if let Some(ref reference) = database.reference {
        warn!("reference archive {} is not served", reference.display());
    }

    let registry = Registry::from_config(&config.judger);
    if registry.languages().is_empty() {
        warn!("no language toolchain is available");
    }

    let engine = JudgeEngine::new(&config.judger, registry, store)?;
    engine.start(config.judger.engine.workers)?;
    Ok(Arc::new(engine))
}

/// Serves until Ctrl-C, then drains the engine.
pub async fn run(config: Config) -> Result<()> {
    let engine = open_engine(&config)?;
    let app = Arc::new(App::new(Arc::clone(&engine)));

    let host: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid host: {}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to listen for ctrl-c");
            futures::future::pending::<()>().await;
        }
        info!("shutting down");
    };

    let (addr, server) = warp::serve(routes::routes(app))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .context("failed to bind")?;
    info!("server is listening {}", addr);

    server.await;

    tokio::task::spawn_blocking(move || engine.stop()).await?;
    info!("judge engine drained");
    Ok(())
}
