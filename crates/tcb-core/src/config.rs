use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::ResourceKind, errors::Error, Result};

/// Inclusive bound on the lifetime (in hours) a user may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifetimeBounds {
    pub min_hours: u32,
    pub max_hours: u32,
}

impl LifetimeBounds {
    pub const fn new(min_hours: u32, max_hours: u32) -> Self {
        Self {
            min_hours,
            max_hours,
        }
    }

    pub fn contains(&self, hours: u32) -> bool {
        (self.min_hours..=self.max_hours).contains(&hours)
    }
}

/// Per-kind lifetime policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifetimePolicy {
    pub voice: LifetimeBounds,
    pub text: LifetimeBounds,
    pub default_hours: u32,
}

impl Default for LifetimePolicy {
    fn default() -> Self {
        Self {
            voice: LifetimeBounds::new(1, 24),
            text: LifetimeBounds::new(1, 72),
            default_hours: 3,
        }
    }
}

impl LifetimePolicy {
    pub fn bounds(&self, kind: ResourceKind) -> LifetimeBounds {
        match kind {
            ResourceKind::Voice => self.voice,
            ResourceKind::Text => self.text,
        }
    }

    pub fn check(&self, kind: ResourceKind, hours: u32) -> Result<()> {
        let b = self.bounds(kind);
        if b.contains(hours) {
            return Ok(());
        }
        Err(Error::InvalidLifetime {
            kind,
            hours,
            min: b.min_hours,
            max: b.max_hours,
        })
    }

    fn validate(&self) -> Result<()> {
        for kind in ResourceKind::ALL {
            let b = self.bounds(kind);
            if b.min_hours == 0 || b.min_hours > b.max_hours {
                return Err(Error::Config(format!(
                    "{kind} lifetime bounds must satisfy 1 <= min <= max (got {}-{})",
                    b.min_hours, b.max_hours
                )));
            }
            if !b.contains(self.default_hours) {
                return Err(Error::Config(format!(
                    "DEFAULT_LIFETIME_HOURS={} is outside the {kind} bounds {}-{}",
                    self.default_hours, b.min_hours, b.max_hours
                )));
            }
        }
        Ok(())
    }
}

/// Typed configuration, loaded from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // Discord
    pub discord_bot_token: Option<String>,
    pub discord_guild_id: Option<u64>,
    pub discord_category_id: Option<u64>,
    pub discord_api_base: String,

    // Storage
    pub database_path: PathBuf,

    // Sweeper
    pub sweep_interval: Duration,
    pub store_failure_limit: u32,

    // Lifecycle
    pub lifetimes: LifetimePolicy,
    pub provider_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_bot_token: None,
            discord_guild_id: None,
            discord_category_id: None,
            discord_api_base: "https://discord.com/api/v10".to_string(),
            database_path: PathBuf::from("./db.sqlite"),
            sweep_interval: Duration::from_secs(30 * 60),
            store_failure_limit: 3,
            lifetimes: LifetimePolicy::default(),
            provider_timeout: Duration::from_millis(10_000),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the process env in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let str_of = |k: &str| lookup(k).and_then(non_empty);
        let u64_of = |k: &str| -> Result<Option<u64>> {
            match str_of(k) {
                None => Ok(None),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| Error::Config(format!("{k} must be an unsigned integer, got {v:?}"))),
            }
        };
        let u32_of = |k: &str| -> Result<Option<u32>> {
            match u64_of(k)? {
                None => Ok(None),
                Some(v) => u32::try_from(v)
                    .map(Some)
                    .map_err(|_| Error::Config(format!("{k} is out of range: {v}"))),
            }
        };

        // Token / guild names from the original deployment are accepted as fallbacks.
        let discord_bot_token = str_of("DISCORD_BOT_TOKEN").or_else(|| str_of("TOKEN"));
        let discord_guild_id = match u64_of("DISCORD_GUILD_ID")? {
            Some(v) => Some(v),
            None => u64_of("SERVERID")?,
        };
        let discord_category_id = u64_of("DISCORD_CATEGORY_ID")?;
        let discord_api_base = str_of("DISCORD_API_BASE")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(d.discord_api_base);

        let database_path = lookup("DATABASE_PATH")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or(d.database_path);

        let sweep_interval = u64_of("SWEEP_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(d.sweep_interval);
        let store_failure_limit = u32_of("STORE_FAILURE_LIMIT")?.unwrap_or(d.store_failure_limit);
        let provider_timeout = u64_of("PROVIDER_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(d.provider_timeout);

        let dl = d.lifetimes;
        let lifetimes = LifetimePolicy {
            voice: LifetimeBounds::new(
                u32_of("VOICE_LIFETIME_MIN_HOURS")?.unwrap_or(dl.voice.min_hours),
                u32_of("VOICE_LIFETIME_MAX_HOURS")?.unwrap_or(dl.voice.max_hours),
            ),
            text: LifetimeBounds::new(
                u32_of("TEXT_LIFETIME_MIN_HOURS")?.unwrap_or(dl.text.min_hours),
                u32_of("TEXT_LIFETIME_MAX_HOURS")?.unwrap_or(dl.text.max_hours),
            ),
            default_hours: u32_of("DEFAULT_LIFETIME_HOURS")?.unwrap_or(dl.default_hours),
        };

        let cfg = Self {
            discord_bot_token,
            discord_guild_id,
            discord_category_id,
            discord_api_base,
            database_path,
            sweep_interval,
            store_failure_limit,
            lifetimes,
            provider_timeout,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(Error::Config(
                "SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.provider_timeout.is_zero() {
            return Err(Error::Config(
                "PROVIDER_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }
        if self.store_failure_limit == 0 {
            return Err(Error::Config(
                "STORE_FAILURE_LIMIT must be greater than zero".to_string(),
            ));
        }
        self.lifetimes.validate()
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
