use obi_controller::config::Config;
use obi_judger::data::{build_database, generate_password};
use obi_utils::tracing::setup_tracing;

use std::path::{Path, PathBuf};

use anyhow::Result;
use dotenv::dotenv;
use structopt::StructOpt;
use tracing::info;

const NAME: &str = "obijudge";
const VERSION: &str = "0.1";

#[derive(Debug, StructOpt)]
#[structopt(name = "obijudge")]
enum Opt {
    /// Serves the judge
    Run {
        #[structopt(long, default_value = "obijudge.toml")]
        config: PathBuf,

        #[structopt(long)]
        port: Option<u16>,

        #[structopt(long)]
        database: Option<PathBuf>,

        /// Language reference archive
        #[structopt(long)]
        reference: Option<PathBuf>,

        #[structopt(long)]
        workers: Option<usize>,
    },
    /// Packs a problem folder into a sealed database
    Builddb {
        #[structopt(long, default_value = "contests")]
        source: PathBuf,

        #[structopt(long, default_value = "contests.zip")]
        target: PathBuf,

        /// Generated when empty
        #[structopt(long, default_value = "")]
        password: String,
    },
    /// Prints name and version
    Info,
}

#[tracing::instrument(err)]
fn load_config(path: &Path) -> Result<Config> {
    info!("loading config from {}", path.display());
    let config = Config::load(path)?;
    info!("config is loaded:\n{:#?}", config);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    setup_tracing();

    match Opt::from_args() {
        Opt::Run {
            config,
            port,
            database,
            reference,
            workers,
        } => {
            let mut config = load_config(&config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(database) = database {
                config.database.path = database;
            }
            if reference.is_some() {
                config.database.reference = reference;
            }
            if let Some(workers) = workers {
                config.judger.engine.workers = workers.max(1);
            }
            obi_controller::run(config).await
        }
        Opt::Builddb {
            source,
            target,
            mut password,
        } => {
            if password.is_empty() {
                password = generate_password();
                println!("password: {}", password);
            }
            build_database(&source, &target, &password)?;
            println!("database written to {}", target.display());
            Ok(())
        }
        Opt::Info => {
            println!("{} version {}", NAME, VERSION);
            Ok(())
        }
    }
}
