//! CLI commands.

mod check;
mod replay;
mod run;

pub use check::CheckCommand;
pub use replay::ReplayCommand;
pub use run::RunCommand;

use std::path::Path;

use anyhow::{Context, Result};
use camnet_handover::{HandoverConfig, HandoverError};

use crate::Cli;

/// Loads `--config`, or the defaults when it is not given.
pub(crate) fn load_config(cli: &Cli) -> Result<HandoverConfig> {
    match &cli.config {
        Some(path) => HandoverConfig::load(Path::new(path))
            .with_context(|| format!("load config {path}")),
        None => {
            let cfg = HandoverConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

/// Whether the error chain carries a registry invariant violation.
pub(crate) fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<HandoverError>())
        .any(HandoverError::is_fatal)
}

/// A camera given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CameraSource {
    pub id: String,
    pub uri: String,
}

/// Parses `id=uri`; a bare `uri` gets the id `camera_<index>`.
pub(crate) fn parse_source(index: usize, arg: &str) -> CameraSource {
    match arg.split_once('=') {
        Some((id, uri)) if !id.is_empty() => CameraSource {
            id: id.to_string(),
            uri: uri.to_string(),
        },
        _ => CameraSource {
            id: format!("camera_{index}"),
            uri: arg.to_string(),
        },
    }
}
