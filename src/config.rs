//! Server configuration, read from the environment at startup.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::auth::PasswordHashing;

pub const DEV_SECRET: &str = "dev_secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub store: StoreBackend,
    pub session_secret: String,
    pub hash_rounds: u32,
    pub request_timeout: Duration,
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid {}=`{}`: {}", key, raw, err)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host: IpAddr = parse_or(&lookup, "HOST", IpAddr::V4(Ipv4Addr::LOCALHOST))?;
        let port: u16 = parse_or(&lookup, "PORT", 8080)?;

        let store = match lookup("DATABASE_URL").filter(|url| !url.is_empty()) {
            Some(url) => StoreBackend::Postgres { url },
            None => StoreBackend::Memory,
        };

        // JWT_SECRET is the name older deployments used.
        let session_secret = match lookup("SESSION_SECRET")
            .filter(|s| !s.is_empty())
            .or_else(|| lookup("JWT_SECRET").filter(|s| !s.is_empty()))
        {
            Some(secret) => secret,
            None => {
                log::warn!("SESSION_SECRET is not set, using the development secret");
                DEV_SECRET.to_string()
            }
        };

        let hash_rounds =
            parse_or(&lookup, "PASSWORD_HASH_ROUNDS", PasswordHashing::DEFAULT_ROUNDS)?;
        if hash_rounds < PasswordHashing::MIN_ROUNDS {
            bail!(
                "PASSWORD_HASH_ROUNDS must be at least {}, got {}",
                PasswordHashing::MIN_ROUNDS,
                hash_rounds
            );
        }

        let timeout_secs: u64 = parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 10)?;
        if timeout_secs == 0 {
            bail!("REQUEST_TIMEOUT_SECS must be positive");
        }

        Ok(Self {
            addr: SocketAddr::new(host, port),
            store,
            session_secret,
            hash_rounds,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}
