use std::sync::Arc;
use std::time::Duration;

use pagekeeper_service::config::Config;
use pagekeeper_service::services::SharedServices;
use pagekeeper_service::telemetry::RecordingTelemetry;
use pagekeeper_test as test;

pub use test::{HitCounter, TempDir, tempdir};

/// Setup tests and create the services to test.
///
/// Returns the services, the telemetry they report to, and a temporary cache directory. The
/// directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until the
/// test has finished.
///
/// Downloads are configured with tiny backoff delays. The `update_config` closure can modify any
/// configuration before the services are created.
pub fn setup_services(
    update_config: impl FnOnce(&mut Config),
) -> (SharedServices, Arc<RecordingTelemetry>, TempDir) {
    test::setup();

    let cache_dir = tempdir();

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    config.downloads.backoff_base = Duration::from_millis(1);
    config.downloads.backoff_cap = Duration::from_millis(10);
    config.downloads.attempt_timeout = Duration::from_secs(5);
    update_config(&mut config);

    let telemetry = RecordingTelemetry::new();
    let services = SharedServices::new(config, telemetry.clone()).unwrap();

    (services, telemetry, cache_dir)
}
