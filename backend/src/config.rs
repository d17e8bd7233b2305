use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use exchange_core::DEFAULT_MAX_ATTEMPTS;

pub const STATE_PATH_VAR: &str = "EXCHANGE_STATE_PATH";
pub const BIND_ADDR_VAR: &str = "EXCHANGE_BIND_ADDR";
pub const SAVE_TIMEOUT_VAR: &str = "EXCHANGE_SAVE_TIMEOUT_MS";
pub const MAX_DRAW_ATTEMPTS_VAR: &str = "EXCHANGE_MAX_DRAW_ATTEMPTS";
pub const DRAW_SEED_VAR: &str = "EXCHANGE_DRAW_SEED";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not valid: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    // in-memory only when unset
    pub state_path: Option<PathBuf>,
    pub bind_addr: SocketAddr,
    pub save_timeout: Duration,
    pub max_draw_attempts: usize,
    pub draw_seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_path: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            save_timeout: Duration::from_millis(2000),
            max_draw_attempts: DEFAULT_MAX_ATTEMPTS,
            draw_seed: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let max_draw_attempts = match get(MAX_DRAW_ATTEMPTS_VAR) {
            Some(raw) => match parse::<usize>(MAX_DRAW_ATTEMPTS_VAR, raw)? {
                0 => {
                    return Err(ConfigError::Invalid {
                        var: MAX_DRAW_ATTEMPTS_VAR,
                        value: "0".into(),
                    })
                }
                n => n,
            },
            None => defaults.max_draw_attempts,
        };

        Ok(Self {
            state_path: get(STATE_PATH_VAR).map(PathBuf::from),
            bind_addr: get(BIND_ADDR_VAR)
                .map(|raw| parse(BIND_ADDR_VAR, raw))
                .transpose()?
                .unwrap_or(defaults.bind_addr),
            save_timeout: get(SAVE_TIMEOUT_VAR)
                .map(|raw| parse::<u64>(SAVE_TIMEOUT_VAR, raw).map(Duration::from_millis))
                .transpose()?
                .unwrap_or(defaults.save_timeout),
            max_draw_attempts,
            draw_seed: get(DRAW_SEED_VAR)
                .map(|raw| parse(DRAW_SEED_VAR, raw))
                .transpose()?,
        })
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value: raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        assert_eq!(settings(&[]).unwrap(), Settings::default());
    }

    #[test]
    fn reads_every_variable() {
        let parsed = settings(&[
            (STATE_PATH_VAR, "/var/lib/exchange/state.json"),
            (BIND_ADDR_VAR, "127.0.0.1:8080"),
            (SAVE_TIMEOUT_VAR, "250"),
            (MAX_DRAW_ATTEMPTS_VAR, "50"),
            (DRAW_SEED_VAR, "7"),
        ])
        .unwrap();
        assert_eq!(
            parsed.state_path,
            Some(PathBuf::from("/var/lib/exchange/state.json"))
        );
        assert_eq!(parsed.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(parsed.save_timeout, Duration::from_millis(250));
        assert_eq!(parsed.max_draw_attempts, 50);
        assert_eq!(parsed.draw_seed, Some(7));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let parsed = settings(&[(STATE_PATH_VAR, "  "), (DRAW_SEED_VAR, "")]).unwrap();
        assert_eq!(parsed, Settings::default());
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(
            settings(&[(SAVE_TIMEOUT_VAR, "soon")]).unwrap_err(),
            ConfigError::Invalid {
                var: SAVE_TIMEOUT_VAR,
                value: "soon".into()
            }
        );
        assert!(settings(&[(BIND_ADDR_VAR, "not-an-addr")]).is_err());
        assert!(settings(&[(MAX_DRAW_ATTEMPTS_VAR, "0")]).is_err());
    }
}
