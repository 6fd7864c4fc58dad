//! # Configuration Options
//!
//! This module defines configuration options.
//!
//! This module is base for `cli` module and not dependent on it. Therefore,
//! this module can be used independently.
//!
//! ## Configuration File
//!
//! Configuration options can be read from a TOML file. File contents are
//! described in [`ArkConfig`]. Any option can then be overridden by an
//! `ARK_*` environment variable, see [`ArkConfig::apply_env_overrides`].

use crate::errors::ArkError;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Amount, Network};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const BLOCKS_PER_HOUR: u32 = 6;

pub const BLOCKS_PER_DAY: u32 = BLOCKS_PER_HOUR * 24;

/// Protocol parameters of the rounds a coordinator runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundParams {
    /// Maximum number of children of a claim tree node.
    pub tree_radix: usize,
    /// Rounds with fewer participants are aborted.
    pub min_participants: usize,
    /// Registration closes early once this many claims are accepted.
    pub max_participants: usize,
    pub min_claim_value: Amount,
    pub max_claim_value: Amount,
    /// Fee the claim tree's node transactions pay in total.
    pub round_fee: Amount,
    /// Fee a forfeit transaction pays.
    pub forfeit_fee: Amount,
    pub round_submit_time_ms: u64,
    pub round_sign_time_ms: u64,
    /// Pause between two rounds.
    pub round_interval_ms: u64,
    /// Tree rebuilds after participants were excluded during signing.
    pub max_rebuilds: usize,
    /// Blocks after the round until the coordinator can sweep the tree.
    pub vtxo_expiry_delta: u32,
    /// Relative timelock of a claim's unilateral exit.
    pub exit_delta: u16,
    /// Boarding outputs need this many confirmations to fund a claim.
    pub boarding_min_confirmations: u32,
    /// Confirmation target of the funding transaction.
    pub fee_target_blocks: u16,
}

impl RoundParams {
    pub fn regtest() -> Self {
        Self {
            tree_radix: 4,
            min_participants: 1,
            max_participants: 128,
            min_claim_value: Amount::from_sat(330),
            max_claim_value: Amount::from_int_btc(1),
            round_fee: Amount::from_sat(500),
            forfeit_fee: Amount::from_sat(200),
            round_submit_time_ms: 2_000,
            round_sign_time_ms: 5_000,
            round_interval_ms: 1_000,
            max_rebuilds: 1,
            vtxo_expiry_delta: BLOCKS_PER_DAY,
            exit_delta: 12,
            boarding_min_confirmations: 1,
            fee_target_blocks: 6,
        }
    }

    pub fn mainnet() -> Self {
        Self {
            tree_radix: 4,
            min_participants: 2,
            max_participants: 512,
            min_claim_value: Amount::from_sat(330),
            max_claim_value: Amount::from_int_btc(10),
            round_fee: Amount::from_sat(5_000),
            forfeit_fee: Amount::from_sat(1_000),
            round_submit_time_ms: 30_000,
            round_sign_time_ms: 60_000,
            round_interval_ms: 30_000,
            max_rebuilds: 1,
            vtxo_expiry_delta: BLOCKS_PER_DAY * 28,
            exit_delta: BLOCKS_PER_DAY as u16,
            boarding_min_confirmations: 6,
            fee_target_blocks: 3,
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Bitcoin => Self::mainnet(),
            _ => Self::regtest(),
        }
    }

    pub fn submit_time(&self) -> Duration {
        Duration::from_millis(self.round_submit_time_ms)
    }

    pub fn sign_time(&self) -> Duration {
        Duration::from_millis(self.round_sign_time_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ArkError> {
        let mut misconfigs = Vec::new();

        if self.tree_radix < 2 {
            misconfigs.push("tree_radix must be at least 2");
        }
        if self.min_participants == 0 {
            misconfigs.push("min_participants must be at least 1");
        }
        if self.min_participants > self.max_participants {
            misconfigs.push("min_participants exceeds max_participants");
        }
        if self.min_claim_value > self.max_claim_value {
            misconfigs.push("min_claim_value exceeds max_claim_value");
        }
        if self.exit_delta == 0 {
            misconfigs.push("exit_delta must be positive");
        }

        if !misconfigs.is_empty() {
            return Err(ArkError::ConfigError(format!(
                "Invalid round parameters: {misconfigs:?}"
            )));
        }

        Ok(())
    }
}

impl Default for RoundParams {
    fn default() -> Self {
        Self::regtest()
    }
}

/// Configuration options for the coordinator daemon and tests.
#[derive(Debug, Clone, Deserialize)]
pub struct ArkConfig {
    pub network: Network,
    /// Coordinator's signing key. Co-signs every claim tree node.
    pub secret_key: SecretKey,
    /// SQLite database URL, e.g. `sqlite://ark.db` or `sqlite::memory:`.
    pub db_url: String,
    /// Bitcoin remote procedure call URL.
    pub bitcoin_rpc_url: String,
    /// Bitcoin RPC user.
    pub bitcoin_rpc_user: SecretString,
    /// Bitcoin RPC user password.
    pub bitcoin_rpc_password: SecretString,
    /// Prometheus exporter listen address. Metrics aren't exported if unset.
    pub metrics_addr: Option<SocketAddr>,
    /// Protocol parameters. Defaults to the network's preset.
    pub round: Option<RoundParams>,
}

impl ArkConfig {
    /// Read contents of a TOML file and generate an `ArkConfig`.
    pub fn try_parse_file(path: &Path) -> Result<Self, ArkError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ArkError::ConfigError(format!("{}: {e}", path.display())))?;

        tracing::trace!("Using configuration file: {:?}", path);

        ArkConfig::try_parse_from(&contents)
    }

    /// Try to parse an `ArkConfig` from given TOML formatted string.
    pub fn try_parse_from(input: &str) -> Result<Self, ArkError> {
        toml::from_str::<ArkConfig>(input).map_err(|e| ArkError::ConfigError(e.to_string()))
    }

    /// Builds a configuration from environment variables only. `ARK_SECRET_KEY`
    /// is required, everything else falls back to the defaults.
    pub fn from_env() -> Result<Self, ArkError> {
        let secret_key = read_env::<SecretKey>("ARK_SECRET_KEY")?
            .ok_or(ArkError::EnvVarNotSet(std::env::VarError::NotPresent, "ARK_SECRET_KEY"))?;

        let mut config = ArkConfig {
            secret_key,
            ..Default::default()
        };
        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Overrides options with the `ARK_*` environment variables that are set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ArkError> {
        if let Some(network) = read_env("ARK_NETWORK")? {
            self.network = network;
        }
        if let Some(secret_key) = read_env("ARK_SECRET_KEY")? {
            self.secret_key = secret_key;
        }
        if let Some(db_url) = read_env("ARK_DB_URL")? {
            self.db_url = db_url;
        }
        if let Some(url) = read_env("ARK_BITCOIN_RPC_URL")? {
            self.bitcoin_rpc_url = url;
        }
        if let Some(user) = read_env::<String>("ARK_BITCOIN_RPC_USER")? {
            self.bitcoin_rpc_user = user.into();
        }
        if let Some(password) = read_env::<String>("ARK_BITCOIN_RPC_PASSWORD")? {
            self.bitcoin_rpc_password = password.into();
        }
        if let Some(addr) = read_env("ARK_METRICS_ADDR")? {
            self.metrics_addr = Some(addr);
        }

        Ok(())
    }

    /// Round parameters in effect: the configured ones or the network's
    /// preset.
    pub fn round_params(&self) -> RoundParams {
        self.round
            .clone()
            .unwrap_or_else(|| RoundParams::for_network(self.network))
    }

    pub fn validate(&self) -> Result<(), ArkError> {
        self.round_params().validate()?;

        if self.network == Network::Bitcoin && self.db_url.contains(":memory:") {
            return Err(ArkError::ConfigError(
                "An in-memory database can't be used on mainnet".into(),
            ));
        }

        Ok(())
    }
}

impl Default for ArkConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            secret_key: SecretKey::from_slice(&[0x11; 32]).expect("known valid input"),
            db_url: "sqlite::memory:".to_string(),
            bitcoin_rpc_url: "http://127.0.0.1:18443/wallet/admin".to_string(),
            bitcoin_rpc_user: "admin".to_string().into(),
            bitcoin_rpc_password: "admin".to_string().into(),
            metrics_addr: None,
            round: None,
        }
    }
}

/// Reads and parses an environment variable. `None` if it isn't set.
fn read_env<T: FromStr>(name: &'static str) -> Result<Option<T>, ArkError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ArkError::EnvVarMalformed(name, e.to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ArkError::EnvVarNotSet(e, name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    const CONFIG: &str = r#"
network = "regtest"
secret_key = "2222222222222222222222222222222222222222222222222222222222222222"
db_url = "sqlite::memory:"
bitcoin_rpc_url = "http://127.0.0.1:18443/wallet/ark"
bitcoin_rpc_user = "ark"
bitcoin_rpc_password = "hunter2"
metrics_addr = "127.0.0.1:9100"

[round]
tree_radix = 2
min_participants = 2
max_participants = 16
min_claim_value = 1000
max_claim_value = 100000000
round_fee = 5
forfeit_fee = 100
round_submit_time_ms = 500
round_sign_time_ms = 1000
round_interval_ms = 100
max_rebuilds = 2
vtxo_expiry_delta = 144
exit_delta = 6
boarding_min_confirmations = 3
fee_target_blocks = 2
"#;

    #[test]
    fn parse_from_string() {
        let config = ArkConfig::try_parse_from(CONFIG).unwrap();

        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.bitcoin_rpc_password.expose_secret(), "hunter2");
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));

        let params = config.round_params();
        assert_eq!(params.tree_radix, 2);
        assert_eq!(params.round_fee, Amount::from_sat(5));
        assert_eq!(params.boarding_min_confirmations, 3);
        assert_eq!(params.sign_time(), Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn parse_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = ArkConfig::try_parse_file(file.path()).unwrap();
        assert_eq!(config.db_url, "sqlite::memory:");

        assert!(matches!(
            ArkConfig::try_parse_file(Path::new("/nonexistent/ark.toml")),
            Err(ArkError::ConfigError(_))
        ));
    }

    #[test]
    fn missing_round_section_uses_network_preset() {
        let input = CONFIG.split("[round]").next().unwrap();
        let config = ArkConfig::try_parse_from(input).unwrap();

        assert_eq!(config.round_params(), RoundParams::regtest());
        assert!(ArkConfig::try_parse_from("network = 5").is_err());
    }

    #[test]
    fn invalid_round_params() {
        let mut params = RoundParams::regtest();
        params.validate().unwrap();
        RoundParams::mainnet().validate().unwrap();

        params.min_participants = params.max_participants + 1;
        params.tree_radix = 1;
        assert!(matches!(params.validate(), Err(ArkError::ConfigError(_))));
    }

    #[test]
    fn env_overrides() {
        let mut config = ArkConfig::default();

        std::env::set_var("ARK_BITCOIN_RPC_URL", "http://10.0.0.1:8332");
        std::env::set_var("ARK_METRICS_ADDR", "not an address");
        let res = config.apply_env_overrides();
        std::env::remove_var("ARK_METRICS_ADDR");

        assert!(matches!(
            res,
            Err(ArkError::EnvVarMalformed("ARK_METRICS_ADDR", _))
        ));
        config.apply_env_overrides().unwrap();
        std::env::remove_var("ARK_BITCOIN_RPC_URL");

        assert_eq!(config.bitcoin_rpc_url, "http://10.0.0.1:8332");
    }
}
