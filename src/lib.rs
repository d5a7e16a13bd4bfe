#[macro_use]
extern crate rocket;

use rocket::{fairing::AdHoc, Build, Rocket};

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod limiter;
pub mod logging;
pub mod model;
pub mod phase;
pub mod voting;

pub use config::Config;

use api::public::StatusCache;
use limiter::RateLimiter;

/// Build the rocket instance: config, database, in-process stores,
/// logging, and all routes. Does not ignite or launch.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(config::ConfigFairing)
        .attach(config::DatabaseFairing)
        .attach(logging::LoggerFairing)
        .attach(stores_fairing())
}

/// Construct the rate limiter and status cache from the loaded config and
/// put them in managed state. Both are per-process; a multi-instance
/// deployment would swap their backends here without touching call sites.
fn stores_fairing() -> AdHoc {
    AdHoc::try_on_ignite("In-process stores", |rocket| async {
        let config = match rocket.state::<Config>() {
            Some(config) => config,
            None => {
                log::error!("Config must be loaded before the in-process stores");
                return Err(rocket);
            }
        };

        let limiter = RateLimiter::new(config.rate_limits().clone());
        // Requires the async runtime, which is live by ignite time.
        limiter.spawn_pruner();

        Ok(rocket.manage(limiter).manage(StatusCache::new()))
    })
}
