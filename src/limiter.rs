//! Per-IP sliding-window rate limiting for sensitive actions.
//!
//! State is in-process only and resets on restart; each instance of a
//! multi-instance deployment would count independently. The store sits
//! behind this type so a shared backend can replace it without touching
//! call sites.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use rocket::{
    request::{self, FromRequest, Request},
    tokio::{self, sync::Mutex, time},
};

use crate::config::RateLimits;

// Bucket names, one per action class. Presets live in config.
pub const REGISTER_BUCKET: &str = "register";
pub const VERIFY_BUCKET: &str = "verify";
pub const CAST_BUCKET: &str = "cast";
pub const ORGANIZER_BUCKET: &str = "organizer";

/// How often the background task sweeps out empty keys.
const PRUNE_INTERVAL_SECS: u64 = 60;

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Seconds until a retry can succeed; zero when allowed.
    pub retry_after_seconds: u64,
}

impl Decision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }
}

/// Sliding-window event counts keyed by (bucket, identity).
///
/// Cheap to clone; clones share the same underlying store.
#[derive(Clone)]
pub struct RateLimiter {
    presets: Arc<RateLimits>,
    events: Arc<Mutex<HashMap<(String, String), Vec<DateTime<Utc>>>>>,
}

impl RateLimiter {
    pub fn new(presets: RateLimits) -> Self {
        Self {
            presets: Arc::new(presets),
            events: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check and record an event for (bucket, identity) now.
    pub async fn allow(&self, bucket: &str, identity: &ClientIp) -> Decision {
        self.allow_at(bucket, &identity.to_string(), Utc::now()).await
    }

    /// Check and record an event at an explicit instant.
    pub async fn allow_at(&self, bucket: &str, identity: &str, now: DateTime<Utc>) -> Decision {
        let preset = match self.presets.get(bucket) {
            Some(preset) => *preset,
            None => {
                // Misconfiguration: fail open rather than lock everyone out.
                warn!("No rate limit preset for bucket '{bucket}', allowing");
                return Decision::allowed();
            }
        };
        let window = Duration::seconds(preset.window_seconds.into());

        let mut events = self.events.lock().await;
        let timestamps = events
            .entry((bucket.to_string(), identity.to_string()))
            .or_default();

        // Slide the window: discard everything older than now - window.
        timestamps.retain(|&instant| instant > now - window);

        if timestamps.len() >= preset.limit as usize {
            // Full: the caller may retry once the oldest event expires. A
            // zero-limit preset has no oldest event and never admits anyone.
            let oldest = timestamps.first().copied().unwrap_or(now);
            let millis = (oldest + window - now).num_milliseconds().max(0);
            let retry_after_seconds = ((millis + 999) / 1000) as u64;
            return Decision {
                allowed: false,
                retry_after_seconds,
            };
        }

        timestamps.push(now);
        Decision::allowed()
    }

    /// Remove keys whose events have all expired. Correctness-neutral: a
    /// pruned key recreated by the next `allow` behaves as if it had never
    /// been pruned.
    pub async fn prune(&self) {
        self.prune_at(Utc::now()).await
    }

    pub async fn prune_at(&self, now: DateTime<Utc>) {
        let mut events = self.events.lock().await;
        events.retain(|(bucket, _), timestamps| {
            let window = match self.presets.get(bucket) {
                Some(preset) => Duration::seconds(preset.window_seconds.into()),
                None => Duration::zero(),
            };
            timestamps.retain(|&instant| instant > now - window);
            !timestamps.is_empty()
        });
        debug!("Rate limiter pruned to {} active keys", events.len());
    }

    /// Spawn the background pruning task. Must be called from within the
    /// async runtime.
    pub fn spawn_pruner(&self) {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(std::time::Duration::from_secs(PRUNE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.prune().await;
            }
        });
    }
}

/// The client identity rate limits are keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl Display for ClientIp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        // Clients with no discernible address share one bucket; strictly
        // fairer than letting them bypass the limiter.
        let ip = req
            .client_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        request::Outcome::Success(ClientIp(ip))
    }
}
