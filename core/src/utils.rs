use crate::cli::Args;
use crate::config::ArkConfig;
use crate::errors::{ArkError, ChainError};
use bitcoin::XOnlyPublicKey;
use std::future::Future;
use std::process::exit;
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

lazy_static::lazy_static! {
    /// Global secp context.
    pub static ref SECP: bitcoin::secp256k1::Secp256k1<bitcoin::secp256k1::All> = bitcoin::secp256k1::Secp256k1::new();
}

lazy_static::lazy_static! {
    /// This is an unspendable pubkey.
    ///
    /// See https://github.com/bitcoin/bips/blob/master/bip-0341.mediawiki#constructing-and-spending-taproot-outputs
    pub static ref UNSPENDABLE_XONLY_PUBKEY: bitcoin::secp256k1::XOnlyPublicKey =
        XOnlyPublicKey::from_str("50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0").expect("this key is valid");
}

/// Gets configuration from CLI, for binaries. If there are any errors, print
/// error to stderr and exit program.
///
/// Steps:
///
/// 1. Get CLI arguments
/// 2. Initialize logger
/// 3. Get configuration file
///
/// # Returns
///
/// A tuple, containing:
///
/// - [`ArkConfig`] from CLI argument
/// - [`Args`] from CLI options
pub fn get_configuration_for_binaries() -> (ArkConfig, Args) {
    let args = match crate::cli::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let level_filter = match args.verbose {
        0 => None,
        other => Some(LevelFilter::from_level(
            Level::from_str(&other.to_string()).unwrap_or(Level::INFO),
        )),
    };

    if let Err(e) = initialize_logger(level_filter) {
        eprintln!("{e}");
        exit(1);
    }

    let config = match crate::cli::get_configuration_from(args.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    (config, args)
}

/// Initializes `tracing` as the logger.
///
/// # Parameters
///
/// - `level`: `None` leaves the level to the `RUST_LOG` env var. Tests should
///   pass `None`, binaries the level the user asked for.
///
/// # Returns
///
/// Returns `Err` if `tracing` can't be initialized. Multiple subscription error
/// is emitted and will return `Ok(())`.
pub fn initialize_logger(level: Option<LevelFilter>) -> Result<(), ArkError> {
    // Human readable logs.
    let layer = fmt::layer().with_test_writer();
    // JSON formatted logs, for log collectors.
    let json_layer = fmt::layer::<Registry>().with_test_writer().json();

    let filter = match level {
        Some(level) => EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy(),
        None => EnvFilter::from_default_env(),
    };

    let res = if std::env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::util::SubscriberInitExt::try_init(
            tracing_subscriber::registry().with(json_layer).with(filter),
        )
    } else {
        tracing_subscriber::util::SubscriberInitExt::try_init(
            tracing_subscriber::registry().with(layer).with(filter),
        )
    };

    if let Err(e) = res {
        // Re-initialization is fine, every test calls this.
        if e.to_string() != "a global default trace dispatcher has already been set" {
            return Err(ArkError::ConfigError(e.to_string()));
        }

        tracing::trace!("Tracing is already initialized, skipping without errors...");
    };

    Ok(())
}

/// Runs `f` until it returns something other than [`ChainError::Transient`],
/// sleeping with exponential backoff between attempts.
///
/// The last transient error is returned once `attempts` are used up.
pub async fn retry_transient<T, F, Fut>(
    attempts: usize,
    initial_backoff: Duration,
    mut f: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 1;

    loop {
        match f().await {
            Err(ChainError::Transient(reason)) if attempt < attempts => {
                tracing::warn!(
                    "Transient chain error (attempt {attempt}/{attempts}), retrying in {backoff:?}: {reason}"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_transient_gives_up_after_attempts() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), _> = retry_transient(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::Transient("node down".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(res, Err(ChainError::Transient(_))));
    }

    #[tokio::test]
    async fn retry_transient_stops_on_terminal_error() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), _> = retry_transient(5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ChainError::Transient("busy".into()))
                } else {
                    Err(ChainError::Funding("no coins".into()))
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(res, Err(ChainError::Funding("no coins".into())));
    }

    #[test]
    fn unspendable_key_is_valid() {
        assert_eq!(
            UNSPENDABLE_XONLY_PUBKEY.to_string(),
            "50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0"
        );
    }
}
