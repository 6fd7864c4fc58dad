//! # Command Line Interface
//!
//! This module defines command line interface for binaries. `Clap` is used
//! for easy generation of help messages and handling arguments.

use crate::config::ArkConfig;
use crate::errors::ArkError;
use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

/// Ark round coordinator.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// TOML formatted configuration file. Without one, the configuration is
    /// read from `ARK_*` environment variables.
    pub config_file: Option<PathBuf>,
    /// Verbosity level, ranging from 0 (none) to 5 (highest)
    #[arg(short, long, default_value_t = 3)]
    pub verbose: u8,
}

/// Parse all the command line arguments.
pub fn parse() -> Result<Args, ArkError> {
    parse_from(env::args())
}

/// Parse given iterator. This is good for isolated environments, like tests.
pub fn parse_from<I, T>(itr: I) -> Result<Args, ArkError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Args::try_parse_from(itr).map_err(|e| ArkError::ConfigError(e.to_string()))
}

/// Reads the configuration file given in `args`, or the environment if there
/// is none, and applies the environment overrides.
pub fn get_configuration_from(args: Args) -> Result<ArkConfig, ArkError> {
    let config = match args.config_file {
        Some(path) => {
            let mut config = ArkConfig::try_parse_file(&path)?;
            config.apply_env_overrides()?;
            config
        }
        None => {
            tracing::info!("No configuration file given, reading the environment...");
            ArkConfig::from_env()?
        }
    };

    config.validate()?;

    Ok(config)
}
