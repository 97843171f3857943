use crate::settings::{
    CoordinationBackend, Settings, SourceKind,
    error::SettingsError,
    validated::{
        CoordinationSettings, LeaseBackend, SourceSettings, TargetSettings, ValidatedSettings,
    },
};
use engine_core::retry::RetryPolicy;
use engine_processing::config::PipelineConfig;
use std::{path::PathBuf, time::Duration};
use tracing::{info, warn};

const LARGE_BATCH_DOCS: usize = 100_000;
const LARGE_BATCH_BYTES: usize = 100 * 1024 * 1024;

/// Checks raw settings and turns them into [`ValidatedSettings`].
///
/// Every problem is collected before failing. Values that are legal but
/// likely mistakes are only logged.
#[derive(Debug, Default)]
pub struct SettingsValidator {
    home_dir: Option<PathBuf>,
}

impl SettingsValidator {
    pub fn new() -> Self {
        Self {
            home_dir: dirs::home_dir(),
        }
    }

    /// Resolves default paths against `home` instead of the user's home directory.
    pub fn with_home_dir(home: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: Some(home.into()),
        }
    }

    pub fn validate(&self, settings: &Settings) -> Result<ValidatedSettings, SettingsError> {
        let mut errors = Vec::new();

        let source = self.validate_source(settings, &mut errors);
        let target = self.validate_target(settings, &mut errors);
        let coordination = self.validate_coordination(settings, &mut errors);
        let pipeline = self.validate_pipeline(settings, &mut errors);

        if !errors.is_empty() {
            return Err(SettingsError::ValidationFailed(errors));
        }

        let (Some(source), Some(coordination)) = (source, coordination) else {
            return Err(SettingsError::ValidationFailed(vec![
                "incomplete settings".to_string(),
            ]));
        };

        let validated = ValidatedSettings {
            source,
            indices: settings.source.indices.clone(),
            target,
            coordination,
            pipeline,
            failed_documents: settings.failed_documents.path.clone(),
        };
        log_validated(&validated);
        Ok(validated)
    }

    fn validate_source(&self, settings: &Settings, errors: &mut Vec<String>) -> Option<SourceSettings> {
        let source = &settings.source;
        if source.snapshot.trim().is_empty() {
            errors.push("source.snapshot must not be empty".to_string());
        }
        if source.snapshot.contains("__") {
            errors.push("source.snapshot must not contain '__'".to_string());
        }

        match source.kind {
            SourceKind::Ndjson => {
                let Some(path) = &source.path else {
                    errors.push("source.path is required for ndjson sources".to_string());
                    return None;
                };
                Some(SourceSettings::Ndjson {
                    path: path.clone(),
                    snapshot: source.snapshot.clone(),
                })
            }
            SourceKind::Synthetic => {
                if source.indices.is_empty() {
                    errors.push("source.indices must list at least one index for synthetic sources".to_string());
                }
                if source.shards == 0 {
                    errors.push("source.shards must be greater than 0".to_string());
                }
                Some(SourceSettings::Synthetic {
                    snapshot: source.snapshot.clone(),
                    shards: source.shards,
                    docs_per_shard: source.docs_per_shard,
                })
            }
        }
    }

    fn validate_target(&self, settings: &Settings, errors: &mut Vec<String>) -> Option<TargetSettings> {
        let target = &settings.target;
        let url = target.url.as_ref()?;

        if !is_http_url(url) {
            errors.push(format!("target.url must start with http:// or https://, got '{url}'"));
        }
        if target.password.is_some() && target.username.is_none() {
            errors.push("target.password is set without target.username".to_string());
        }
        if target.request_timeout_secs == 0 {
            errors.push("target.request_timeout_secs must be greater than 0".to_string());
        }

        Some(TargetSettings {
            url: url.clone(),
            username: target.username.clone(),
            password: target.password.clone(),
            compression: target.compression,
            index_prefix: target.index_prefix.clone(),
            request_timeout: Duration::from_secs(target.request_timeout_secs),
        })
    }

    fn validate_coordination(
        &self,
        settings: &Settings,
        errors: &mut Vec<String>,
    ) -> Option<CoordinationSettings> {
        let c = &settings.coordination;

        if c.initial_lease_secs == 0 {
            errors.push("coordination.initial_lease_secs must be greater than 0".to_string());
        }
        if c.renew_interval_secs == 0 {
            errors.push("coordination.renew_interval_secs must be greater than 0".to_string());
        }
        if c.renew_interval_secs >= c.initial_lease_secs {
            errors.push(format!(
                "coordination.renew_interval_secs ({}) must be shorter than initial_lease_secs ({})",
                c.renew_interval_secs, c.initial_lease_secs
            ));
        } else if c.renew_interval_secs * 2 > c.initial_lease_secs {
            warn!(
                renew_interval_secs = c.renew_interval_secs,
                initial_lease_secs = c.initial_lease_secs,
                "Renew interval is more than half the lease; one slow renewal can lose the lease"
            );
        }
        if c.tolerable_clock_difference_secs >= c.initial_lease_secs {
            errors.push(format!(
                "coordination.tolerable_clock_difference_secs ({}) must be shorter than initial_lease_secs ({})",
                c.tolerable_clock_difference_secs, c.initial_lease_secs
            ));
        } else if c.tolerable_clock_difference_secs + c.min_time_for_batch_secs >= c.initial_lease_secs {
            errors.push(format!(
                "coordination.min_time_for_batch_secs ({}) plus tolerable_clock_difference_secs ({}) leaves no time to work in a {}s lease",
                c.min_time_for_batch_secs, c.tolerable_clock_difference_secs, c.initial_lease_secs
            ));
        }

        let backend = match c.backend {
            CoordinationBackend::Memory => {
                warn!("Memory lease store selected; progress is lost when the process exits");
                LeaseBackend::Memory
            }
            CoordinationBackend::Sled => {
                let path = c
                    .path
                    .clone()
                    .or_else(|| self.home_dir.as_ref().map(|h| h.join(".bulkshift").join("leases")));
                match path {
                    Some(path) => LeaseBackend::Sled { path },
                    None => {
                        errors.push(
                            "coordination.path is required: home directory could not be determined"
                                .to_string(),
                        );
                        return None;
                    }
                }
            }
            CoordinationBackend::Cluster => {
                let Some(url) = &c.url else {
                    errors.push("coordination.url is required for the cluster backend".to_string());
                    return None;
                };
                if !is_http_url(url) {
                    errors.push(format!(
                        "coordination.url must start with http:// or https://, got '{url}'"
                    ));
                }
                LeaseBackend::Cluster {
                    url: url.clone(),
                    index_suffix: c.index_suffix.clone(),
                }
            }
        };

        Some(CoordinationSettings {
            backend,
            initial_lease: Duration::from_secs(c.initial_lease_secs),
            tolerable_clock_difference: Duration::from_secs(c.tolerable_clock_difference_secs),
            renew_interval: Duration::from_secs(c.renew_interval_secs),
            min_time_for_batch: Duration::from_secs(c.min_time_for_batch_secs),
            release_on_exit: c.release_on_exit,
        })
    }

    fn validate_pipeline(&self, settings: &Settings, errors: &mut Vec<String>) -> PipelineConfig {
        let batching = &settings.batching;
        let bulk = &settings.bulk;

        for (name, value) in [
            ("batching.max_docs_per_batch", batching.max_docs_per_batch),
            ("batching.max_bytes_per_batch", batching.max_bytes_per_batch),
            ("bulk.max_concurrent_requests", bulk.max_concurrent_requests),
            ("bulk.queue_depth", bulk.queue_depth),
            ("bulk.max_attempts", bulk.max_attempts),
            ("bulk.burst", bulk.burst as usize),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if batching.max_docs_per_batch > LARGE_BATCH_DOCS {
            warn!(
                max_docs_per_batch = batching.max_docs_per_batch,
                "Batch size is very large, may cause memory issues"
            );
        }
        if batching.max_bytes_per_batch > LARGE_BATCH_BYTES {
            warn!(
                max_bytes_per_batch = batching.max_bytes_per_batch,
                "Batch byte limit exceeds what most clusters accept per request"
            );
        }
        if let Some(rate) = bulk.max_requests_per_second
            && !(rate.is_finite() && rate > 0.0)
        {
            errors.push(format!(
                "bulk.max_requests_per_second must be a positive number, got {rate}"
            ));
        }
        if bulk.base_delay_ms > bulk.max_delay_ms {
            warn!(
                base_delay_ms = bulk.base_delay_ms,
                max_delay_ms = bulk.max_delay_ms,
                "Base retry delay exceeds the maximum; every retry waits the maximum"
            );
        }

        let mut config = PipelineConfig::default()
            .with_batch_limits(batching.max_docs_per_batch, batching.max_bytes_per_batch)
            .with_concurrency(bulk.max_concurrent_requests)
            .with_retry(RetryPolicy::new(
                bulk.max_attempts,
                Duration::from_millis(bulk.base_delay_ms),
                Duration::from_millis(bulk.max_delay_ms),
            ))
            .with_compression(settings.target.compression)
            .with_in_flight_policy(bulk.in_flight_policy)
            .with_serialization_cache_bytes(bulk.serialization_cache_bytes);
        config.queue_depth = bulk.queue_depth;
        if let Some(rate) = bulk.max_requests_per_second {
            config = config.with_rate_limit(rate, bulk.burst);
        }
        config
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn log_validated(settings: &ValidatedSettings) {
    let p = &settings.pipeline;
    let c = &settings.coordination;
    info!(
        snapshot = settings.snapshot(),
        indices = ?settings.indices,
        target = settings.target.as_ref().map(|t| t.url.as_str()),
        lease_backend = ?c.backend,
        initial_lease_secs = c.initial_lease.as_secs(),
        renew_interval_secs = c.renew_interval.as_secs(),
        max_docs_per_batch = p.max_docs_per_batch,
        max_bytes_per_batch = p.max_bytes_per_batch,
        max_concurrent_requests = p.max_concurrent_requests,
        max_requests_per_second = p.max_requests_per_second,
        in_flight_policy = ?p.in_flight_policy,
        "Settings validated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic() -> Settings {
        let mut s = Settings::default();
        s.source.kind = SourceKind::Synthetic;
        s.source.indices = vec!["logs".into()];
        s
    }

    #[test]
    fn defaults_resolve_sled_path_under_home() {
        let validated = SettingsValidator::with_home_dir("/home/u")
            .validate(&synthetic())
            .unwrap();

        assert_eq!(
            validated.coordination.backend,
            LeaseBackend::Sled {
                path: PathBuf::from("/home/u/.bulkshift/leases")
            }
        );
        assert!(validated.target.is_none());
        assert_eq!(validated.pipeline.max_docs_per_batch, 1_000);
        assert_eq!(validated.coordination.initial_lease, Duration::from_secs(600));
    }

    #[test]
    fn collects_every_problem() {
        let mut s = synthetic();
        s.source.indices.clear();
        s.batching.max_docs_per_batch = 0;
        s.coordination.renew_interval_secs = 600;
        s.coordination.backend = CoordinationBackend::Cluster;
        s.target.url = Some("localhost:9200".into());

        let SettingsError::ValidationFailed(errors) =
            SettingsValidator::with_home_dir("/h").validate(&s).unwrap_err()
        else {
            panic!("expected validation failure");
        };

        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("source.indices")));
        assert!(errors.iter().any(|e| e.contains("max_docs_per_batch")));
        assert!(errors.iter().any(|e| e.contains("renew_interval_secs")));
        assert!(errors.iter().any(|e| e.contains("coordination.url")));
        assert!(errors.iter().any(|e| e.contains("target.url")));
    }

    #[test]
    fn lease_must_leave_room_for_a_batch() {
        let mut s = synthetic();
        s.coordination.initial_lease_secs = 30;
        s.coordination.renew_interval_secs = 10;
        s.coordination.tolerable_clock_difference_secs = 5;
        s.coordination.min_time_for_batch_secs = 25;

        let err = SettingsValidator::with_home_dir("/h").validate(&s).unwrap_err();
        assert!(err.to_string().contains("min_time_for_batch_secs"));
    }

    #[test]
    fn ndjson_requires_a_path() {
        let err = SettingsValidator::with_home_dir("/h")
            .validate(&Settings::default())
            .unwrap_err();
        assert!(err.to_string().contains("source.path"));
    }

    #[test]
    fn bulk_section_shapes_pipeline_config() {
        let mut s = synthetic();
        s.bulk.max_requests_per_second = Some(20.0);
        s.bulk.burst = 4;
        s.bulk.queue_depth = 2;
        s.bulk.max_attempts = 3;
        s.target.url = Some("https://target:9200".into());

        let validated = SettingsValidator::with_home_dir("/h").validate(&s).unwrap();
        let p = &validated.pipeline;
        assert_eq!(p.max_requests_per_second, Some(20.0));
        assert_eq!(p.burst, 4);
        assert_eq!(p.queue_depth, 2);
        assert_eq!(p.retry.max_attempts, 3);
        assert_eq!(validated.target.unwrap().url, "https://target:9200");
    }
}
