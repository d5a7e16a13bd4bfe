use std::collections::HashMap;

use chrono::Duration;
use log::{error, info};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::model::mongodb::ensure_indexes_exist;

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Deserialize)]
pub struct Config {
    // non-secrets
    verification_ttl: u32,
    status_cache_ttl: u32,
    rate_limits: RateLimits,
    // secrets
    fingerprint_secret: String,
}

impl Config {
    /// Valid lifetime of an emailed verification code.
    pub fn verification_ttl(&self) -> Duration {
        Duration::seconds(self.verification_ttl.into())
    }

    /// Staleness bound for the public election status cache.
    pub fn status_cache_ttl(&self) -> Duration {
        Duration::seconds(self.status_cache_ttl.into())
    }

    /// Per-bucket sliding-window rate limit presets.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Secret key for hashing device fingerprints at rest.
    pub fn fingerprint_secret(&self) -> &[u8] {
        self.fingerprint_secret.as_bytes()
    }
}

/// A single rate limit: at most `limit` events per sliding `window_seconds`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RatePreset {
    pub limit: u32,
    pub window_seconds: u32,
}

/// Rate limit presets per action class, keyed by bucket name.
pub type RateLimits = HashMap<String, RatePreset>;

/// A fairing that loads the application config and puts it in managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// ensures the required indexes exist, and places both a `Client` and a
/// `Database` into managed state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");

        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(&database_name());

        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to set up database indexes: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        rocket = rocket.manage(client).manage(db);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
fn database_name() -> String {
    "geovote".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
fn database_name() -> String {
    let random: u32 = rand::random();
    format!("test{random}")
}
