use crate::{
    asset,
    chain::RateLimiter,
    config::{file, File},
    engine::EngineSettings,
    terms::LockTimes,
    RelativeTime,
};
use anyhow::Context;
use log::LevelFilter;
use std::{collections::HashSet, time::Duration};

/// The configuration the engine runs with, every default filled in and
/// every value validated.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub logging: Logging,
    pub engine: EngineSettings,
    pub lock_times: LockTimes,
    pub currencies: Vec<CurrencySettings>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Logging {
    pub level: LevelFilter,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::Info,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CurrencySettings {
    pub currency: asset::Currency,
    pub min_request_interval: Duration,
}

impl From<file::Currency> for CurrencySettings {
    fn from(file: file::Currency) -> Self {
        CurrencySettings {
            currency: asset::Currency::new(file.code, file.family, file.decimals),
            min_request_interval: Duration::from_millis(file.min_request_interval_ms.unwrap_or(0)),
        }
    }
}

impl Settings {
    pub fn from_config_file_and_defaults(config_file: File) -> anyhow::Result<Self> {
        let File {
            logging,
            polling,
            refund_guard,
            timeouts,
            lock_times,
            currencies,
        } = config_file;

        let logging = match logging {
            None | Some(file::Logging { level: None }) => Logging::default(),
            Some(file::Logging { level: Some(level) }) => Logging {
                level: level.into(),
            },
        };

        let defaults = EngineSettings::default();
        let mut engine = defaults;

        if let Some(polling) = polling {
            engine.poll_interval = polling
                .interval_secs
                .map_or(defaults.poll_interval, Duration::from_secs);
            engine.max_attempts = polling.max_attempts;
        }
        if let Some(file::RefundGuard {
            check_interval_secs: Some(secs),
        }) = refund_guard
        {
            engine.guard_interval = Duration::from_secs(secs);
        }
        if let Some(timeouts) = timeouts {
            let or_default =
                |secs: Option<u64>, default: Duration| secs.map_or(default, Duration::from_secs);

            engine.party_payment_timeout =
                or_default(timeouts.party_payment_secs, defaults.party_payment_timeout);
            engine.message_timeout = or_default(timeouts.message_secs, defaults.message_timeout);
            engine.redeem_margin =
                or_default(timeouts.redeem_margin_secs, defaults.redeem_margin);
        }

        if engine.poll_interval == Duration::from_secs(0) {
            anyhow::bail!("polling interval must be greater than zero");
        }
        if engine.guard_interval == Duration::from_secs(0) {
            anyhow::bail!("refund guard check interval must be greater than zero");
        }
        if engine.max_attempts == Some(0) {
            anyhow::bail!("maximum number of poll attempts must be greater than zero");
        }

        let lock_times = match lock_times {
            None => LockTimes::default(),
            Some(file::LockTimes {
                initiator_secs,
                acceptor_secs,
            }) => {
                let default = LockTimes::default();
                let initiator = initiator_secs
                    .map_or_else(|| default.window(crate::Role::Initiator), RelativeTime::from);
                let acceptor = acceptor_secs
                    .map_or_else(|| default.window(crate::Role::Acceptor), RelativeTime::from);

                LockTimes::new(initiator, acceptor).context("invalid lock times")?
            }
        };

        let currencies = currencies
            .unwrap_or_default()
            .into_iter()
            .map(CurrencySettings::from)
            .collect::<Vec<_>>();

        let mut codes = HashSet::new();
        for settings in &currencies {
            if !codes.insert(settings.currency.code.as_str()) {
                anyhow::bail!("currency {} is configured twice", settings.currency.code);
            }
        }

        Ok(Settings {
            logging,
            engine,
            lock_times,
            currencies,
        })
    }

    pub fn currency(&self, code: &str) -> Option<&asset::Currency> {
        self.currencies
            .iter()
            .map(|settings| &settings.currency)
            .find(|currency| currency.code == code)
    }

    /// A rate limiter to share between all observers of the endpoint for
    /// `code`.
    pub fn rate_limiter(&self, code: &str) -> anyhow::Result<RateLimiter> {
        let settings = self
            .currencies
            .iter()
            .find(|settings| settings.currency.code == code)
            .with_context(|| format!("currency {} is not configured", code))?;

        Ok(RateLimiter::new(settings.min_request_interval))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            logging: Logging::default(),
            engine: EngineSettings::default(),
            lock_times: LockTimes::default(),
            currencies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chain::ChainFamily, Role};
    use spectral::prelude::*;

    fn currency(code: &str, family: ChainFamily) -> file::Currency {
        file::Currency {
            code: code.to_owned(),
            family,
            decimals: 6,
            min_request_interval_ms: None,
        }
    }

    #[test]
    fn logging_section_defaults_to_info() {
        let config_file = File {
            logging: None,
            ..File::default()
        };

        let settings = Settings::from_config_file_and_defaults(config_file);

        assert_that(&settings)
            .is_ok()
            .map(|settings| &settings.logging)
            .is_equal_to(Logging {
                level: LevelFilter::Info,
            })
    }

    #[test]
    fn empty_file_yields_defaults() {
        let settings = Settings::from_config_file_and_defaults(File::default());

        assert_that(&settings).is_ok().is_equal_to(Settings::default());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config_file = File {
            polling: Some(file::Polling {
                interval_secs: Some(3),
                max_attempts: None,
            }),
            timeouts: Some(file::Timeouts {
                party_payment_secs: None,
                message_secs: Some(30),
                redeem_margin_secs: None,
            }),
            lock_times: Some(file::LockTimes {
                initiator_secs: Some(48 * 3600),
                acceptor_secs: None,
            }),
            ..File::default()
        };

        let settings = Settings::from_config_file_and_defaults(config_file).unwrap();
        let defaults = EngineSettings::default();

        assert_that(&settings.engine.poll_interval).is_equal_to(Duration::from_secs(3));
        assert_that(&settings.engine.message_timeout).is_equal_to(Duration::from_secs(30));
        assert_that(&settings.engine.party_payment_timeout)
            .is_equal_to(defaults.party_payment_timeout);
        assert_that(&settings.lock_times.window(Role::Initiator))
            .is_equal_to(RelativeTime::from_hours(48));
        assert_that(&settings.lock_times.window(Role::Acceptor))
            .is_equal_to(RelativeTime::from_hours(5));
    }

    #[test]
    fn rejects_acceptor_window_longer_than_initiator_window() {
        let config_file = File {
            lock_times: Some(file::LockTimes {
                initiator_secs: Some(3600),
                acceptor_secs: Some(7200),
            }),
            ..File::default()
        };

        let settings = Settings::from_config_file_and_defaults(config_file);

        assert_that(&settings).is_err();
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let config_file = File {
            polling: Some(file::Polling {
                interval_secs: Some(0),
                max_attempts: Some(10),
            }),
            ..File::default()
        };

        let settings = Settings::from_config_file_and_defaults(config_file);

        assert_that(&settings).is_err();
    }

    #[test]
    fn rejects_duplicate_currency() {
        let config_file = File {
            currencies: Some(vec![
                currency("XTZ", ChainFamily::Entrypoint),
                currency("XTZ", ChainFamily::Entrypoint),
            ]),
            ..File::default()
        };

        let settings = Settings::from_config_file_and_defaults(config_file);

        assert_that(&settings).is_err();
    }

    #[test]
    fn looks_up_configured_currency() {
        let config_file = File {
            currencies: Some(vec![
                currency("XTZ", ChainFamily::Entrypoint),
                currency("BTC", ChainFamily::Utxo),
            ]),
            ..File::default()
        };

        let settings = Settings::from_config_file_and_defaults(config_file).unwrap();

        assert_that(&settings.currency("BTC").map(|c| c.family))
            .is_equal_to(Some(ChainFamily::Utxo));
        assert_that(&settings.rate_limiter("BTC")).is_ok();
        assert_that(&settings.rate_limiter("ETH")).is_err();
    }
}
