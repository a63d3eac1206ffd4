use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;

use crate::{config::Config, run};

/// ETRAN request broker.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// path to the service config file
    #[argh(option, default = "PathBuf::from(\"config.yaml\")")]
    pub config: PathBuf,
}

impl Args {
    pub fn run(self) -> anyhow::Result<()> {
        let config = Config::load(&self.config)?;

        etran_logger::init(config.app.debug);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to build tokio runtime")?;
        rt.block_on(run::run(config))
    }
}
