//! Process-level configuration (spec.md §6 "Configuration inputs"):
//! loaded from a TOML file plus environment overrides via the `config`
//! crate, with a `clap`-derived [`Cli`] for overriding individual
//! settings at process launch.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::bft::error::*;

/// Where this replica fetches the swarm's current membership from
/// (spec.md §6: "bootstrap source (file path OR URL OR registry
/// contract address + swarm id)").
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BootstrapSource {
    File { path: PathBuf },
    Url { url: String },
    Registry { contract_address: String, swarm_id: String },
}

/// Per-message signing/verification toggles.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoToggles {
    #[serde(default = "default_true")]
    pub verify_incoming: bool,
    #[serde(default = "default_true")]
    pub verify_outgoing: bool,
    #[serde(default)]
    pub self_verify: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CryptoToggles {
    fn default() -> Self {
        Self {
            verify_incoming: true,
            verify_outgoing: true,
            self_verify: false,
        }
    }
}

/// Synthetic network fault injection, used to exercise the failure
/// detector and view-change path in tests and demos.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChaosConfig {
    #[serde(default)]
    pub drop_probability: f64,
    #[serde(default)]
    pub delay_probability: f64,
}

/// The full set of options a replica process is configured with.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub bootstrap: BootstrapSource,
    pub public_key_path: PathBuf,
    pub private_key_path: PathBuf,
    pub state_dir: PathBuf,
    pub idle_timeout_secs: u64,
    pub checkpoint_interval: u32,
    pub audit_mem_size: usize,
    #[serde(default)]
    pub crypto: CryptoToggles,
    pub monitor_addr: Option<SocketAddr>,
    #[serde(default)]
    pub monitor_collate_interval_secs: u64,
    #[serde(default)]
    pub chaos: ChaosConfig,
    #[serde(default = "default_peer_refresh_interval_secs")]
    pub peer_refresh_interval_secs: u64,
    /// Width of the pre-prepare acceptance window, as a multiple of
    /// `checkpoint_interval` (spec.md §3/§6/P5: a configured multiple,
    /// default `>= 2`, of the checkpoint interval).
    #[serde(default = "default_watermark_multiplier")]
    pub watermark_multiplier: u32,
}

fn default_peer_refresh_interval_secs() -> u64 {
    30
}

fn default_watermark_multiplier() -> u32 {
    crate::bft::consensus::operation::DEFAULT_WATERMARK_MULTIPLIER
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn monitor_collate_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_collate_interval_secs)
    }

    pub fn peer_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.peer_refresh_interval_secs)
    }
}

/// Command-line overrides for a subset of [`Config`]'s fields, each
/// also settable through the matching environment variable.
#[derive(Debug, Parser)]
#[command(name = "swarm-pbft", about = "Bootstrap a swarm-pbft replica process")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SWARM_PBFT_CONFIG")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "SWARM_PBFT_LISTEN_ADDR")]
    pub listen_addr: Option<SocketAddr>,

    #[arg(long, env = "SWARM_PBFT_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[arg(long, env = "SWARM_PBFT_PUBLIC_KEY")]
    pub public_key_path: Option<PathBuf>,

    #[arg(long, env = "SWARM_PBFT_PRIVATE_KEY")]
    pub private_key_path: Option<PathBuf>,

    /// Overrides the bootstrap source to a local membership file.
    #[arg(long, env = "SWARM_PBFT_BOOTSTRAP_FILE")]
    pub bootstrap_file: Option<PathBuf>,
}

impl Cli {
    fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(addr) = self.listen_addr {
            cfg.listen_addr = addr;
        }
        if let Some(dir) = &self.state_dir {
            cfg.state_dir = dir.clone();
        }
        if let Some(path) = &self.public_key_path {
            cfg.public_key_path = path.clone();
        }
        if let Some(path) = &self.private_key_path {
            cfg.private_key_path = path.clone();
        }
        if let Some(path) = &self.bootstrap_file {
            cfg.bootstrap = BootstrapSource::File { path: path.clone() };
        }
    }
}

/// Loads a [`Config`] from `cli.config_file` (if given), environment
/// variables prefixed `SWARM_PBFT__` (double underscore separating
/// nested keys, e.g. `SWARM_PBFT__CRYPTO__SELF_VERIFY`), and finally
/// `cli`'s own individual field overrides, in that ascending order of
/// precedence.
pub fn load(cli: &Cli) -> Result<Config> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = &cli.config_file {
        builder = builder.add_source(::config::File::from(path.as_path()));
    }
    builder = builder.add_source(
        ::config::Environment::with_prefix("SWARM_PBFT")
            .separator("__")
            .try_parsing(true),
    );
    let raw = builder.build().wrapped(ErrorKind::Configuration)?;
    let mut cfg: Config = raw.try_deserialize().wrapped(ErrorKind::Configuration)?;
    cli.apply_overrides(&mut cfg);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win_over_file_values() {
        let mut cfg = Config {
            listen_addr: "127.0.0.1:10000".parse().unwrap(),
            bootstrap: BootstrapSource::File {
                path: "/tmp/peers.toml".into(),
            },
            public_key_path: "/tmp/pub".into(),
            private_key_path: "/tmp/priv".into(),
            state_dir: "/tmp/state".into(),
            idle_timeout_secs: 60,
            checkpoint_interval: 100,
            audit_mem_size: 1024,
            crypto: CryptoToggles::default(),
            monitor_addr: None,
            monitor_collate_interval_secs: 5,
            chaos: ChaosConfig::default(),
            peer_refresh_interval_secs: 30,
            watermark_multiplier: default_watermark_multiplier(),
        };
        let cli = Cli {
            config_file: None,
            listen_addr: Some("0.0.0.0:20000".parse().unwrap()),
            state_dir: Some("/override/state".into()),
            public_key_path: None,
            private_key_path: None,
            bootstrap_file: None,
        };
        cli.apply_overrides(&mut cfg);
        assert_eq!(cfg.listen_addr, "0.0.0.0:20000".parse().unwrap());
        assert_eq!(cfg.state_dir, PathBuf::from("/override/state"));
    }

    #[test]
    fn idle_timeout_converts_seconds_to_a_duration() {
        let cfg = Config {
            listen_addr: "127.0.0.1:10000".parse().unwrap(),
            bootstrap: BootstrapSource::File { path: "/tmp/x".into() },
            public_key_path: "/tmp/pub".into(),
            private_key_path: "/tmp/priv".into(),
            state_dir: "/tmp/state".into(),
            idle_timeout_secs: 45,
            checkpoint_interval: 100,
            audit_mem_size: 1024,
            crypto: CryptoToggles::default(),
            monitor_addr: None,
            monitor_collate_interval_secs: 5,
            chaos: ChaosConfig::default(),
            peer_refresh_interval_secs: 30,
            watermark_multiplier: default_watermark_multiplier(),
        };
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(45));
    }
}
