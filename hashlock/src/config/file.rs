use crate::chain::ChainFamily;
use config as config_rs;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{ffi::OsStr, path::Path};

/// This struct aims to represent the configuration file as it appears on disk.
///
/// Optional elements of the configuration file are represented as `Option`s
/// here. Filling in defaults is a separate step, see
/// [`Settings`](crate::config::Settings).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub logging: Option<Logging>,
    pub polling: Option<Polling>,
    pub refund_guard: Option<RefundGuard>,
    pub timeouts: Option<Timeouts>,
    pub lock_times: Option<LockTimes>,
    pub currencies: Option<Vec<Currency>>,
}

impl File {
    pub fn read<D>(config_file: D) -> Result<Self, config_rs::ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        let mut config = config_rs::Config::new();
        config.merge(config_rs::File::from(config_file))?;
        config.try_into()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Logging {
    pub level: Option<Level>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LevelFilter> for Level {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off | LevelFilter::Error => Level::Error,
            LevelFilter::Warn => Level::Warn,
            LevelFilter::Info => Level::Info,
            LevelFilter::Debug => Level::Debug,
            LevelFilter::Trace => Level::Trace,
        }
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => LevelFilter::Error,
            Level::Warn => LevelFilter::Warn,
            Level::Info => LevelFilter::Info,
            Level::Debug => LevelFilter::Debug,
            Level::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Polling {
    pub interval_secs: Option<u64>,
    /// Absent means polls are bounded by deadlines only.
    pub max_attempts: Option<u32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RefundGuard {
    pub check_interval_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Timeouts {
    pub party_payment_secs: Option<u64>,
    pub message_secs: Option<u64>,
    pub redeem_margin_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LockTimes {
    pub initiator_secs: Option<u32>,
    pub acceptor_secs: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Currency {
    pub code: String,
    pub family: ChainFamily,
    pub decimals: u32,
    /// Minimum delay between two requests to the chain endpoint.
    pub min_request_interval_ms: Option<u64>,
}
