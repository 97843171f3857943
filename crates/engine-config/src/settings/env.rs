use crate::settings::Settings;
use tracing::debug;

pub const TARGET_USERNAME: &str = "BULKSHIFT_TARGET_USERNAME";
pub const TARGET_PASSWORD: &str = "BULKSHIFT_TARGET_PASSWORD";
pub const COORDINATION_URL: &str = "BULKSHIFT_COORDINATION_URL";

/// Applies environment overrides. `lookup` is `std::env::var` outside tests.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(username) = lookup(TARGET_USERNAME) {
        debug!(var = TARGET_USERNAME, "Overriding target username from environment");
        settings.target.username = Some(username);
    }
    if let Some(password) = lookup(TARGET_PASSWORD) {
        debug!(var = TARGET_PASSWORD, "Overriding target password from environment");
        settings.target.password = Some(password);
    }
    if let Some(url) = lookup(COORDINATION_URL) {
        debug!(var = COORDINATION_URL, "Overriding coordination url from environment");
        settings.coordination.url = Some(url);
    }
}
