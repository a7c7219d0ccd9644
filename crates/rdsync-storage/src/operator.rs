//! OpenDAL Operator factory for rdsync storage backends

use anyhow::{bail, Context, Result};
use opendal::{Builder, Operator};
use rdsync_core::config::StorageConfig;

/// Build the operator named by `[storage].backend`.
///
/// `memory` gives every call its own private store, which is what tests and
/// throwaway peers want. `fs` keeps everything under `[storage].root`.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    match cfg.backend.as_str() {
        "memory" => finish(opendal::services::Memory::default()),
        "fs" => {
            let root = cfg
                .root
                .to_str()
                .with_context(|| format!("storage root is not UTF-8: {}", cfg.root.display()))?;
            finish(opendal::services::Fs::default().root(root))
        }
        other => bail!("unknown storage backend '{other}' (expected \"memory\" or \"fs\")"),
    }
}

fn finish<B: Builder>(builder: B) -> Result<Operator> {
    let op = Operator::new(builder)
        .context("creating OpenDAL operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(3)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}
