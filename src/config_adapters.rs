//! Map upper-case settings onto the fetcher, transport and engine configs

use std::collections::BTreeMap;
use std::time::Duration;

use arachne_downloader::{FetcherConfig, HttpHandlerConfig};
use arachne_engine::{EngineConfig, SchedulerType};

use crate::settings::{Result, Settings, SettingsError};

fn seconds(settings: &Settings, key: &str) -> Result<Option<Duration>> {
    match settings.get_opt::<f64>(key)? {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|_| SettingsError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a non-negative number of seconds, got {}", secs),
            }),
        None => Ok(None),
    }
}

/// Build a `FetcherConfig` from settings
pub fn fetcher_config_from_settings(settings: &Settings) -> Result<FetcherConfig> {
    let mut config = FetcherConfig::default();

    if let Some(total) = settings.get_opt("CONCURRENT_REQUESTS")? {
        config = config.with_total_concurrency(total);
    }
    if let Some(per_domain) = settings.get_opt("CONCURRENT_REQUESTS_PER_DOMAIN")? {
        config = config.with_domain_concurrency(per_domain);
    }
    if let Some(per_ip) = settings.get_opt("CONCURRENT_REQUESTS_PER_IP")? {
        config = config.with_ip_concurrency(per_ip);
    }
    if let Some(delay) = seconds(settings, "DOWNLOAD_DELAY")? {
        config = config.with_delay(delay);
    }
    if let Some(randomize) = settings.get_opt("RANDOMIZE_DOWNLOAD_DELAY")? {
        config = config.with_randomize_delay(randomize);
    }

    Ok(config)
}

/// Build an `HttpHandlerConfig` from settings
pub fn http_config_from_settings(settings: &Settings) -> Result<HttpHandlerConfig> {
    let mut config = HttpHandlerConfig::default();

    if let Some(user_agent) = settings.get_opt::<String>("USER_AGENT")? {
        config = config.with_user_agent(user_agent);
    }
    if let Some(timeout) = seconds(settings, "DOWNLOAD_TIMEOUT")? {
        config = config.with_timeout(timeout);
    }
    if let Some(headers) =
        settings.get_opt::<BTreeMap<String, String>>("DEFAULT_REQUEST_HEADERS")?
    {
        for (key, value) in headers {
            config = config.with_default_header(key, value);
        }
    }

    Ok(config)
}

/// Build an `EngineConfig`, including its fetcher and transport configs, from settings
pub fn engine_config_from_settings(settings: &Settings) -> Result<EngineConfig> {
    let fetcher = fetcher_config_from_settings(settings)?;
    let mut config = EngineConfig::default()
        .with_concurrent_items(fetcher.total_concurrency)
        .with_fetcher(fetcher)
        .with_http(http_config_from_settings(settings)?);

    if let Some(items) = settings.get_opt("CONCURRENT_ITEMS")? {
        config = config.with_concurrent_items(items);
    }
    if let Some(path) = settings.get_opt::<String>("DUPEFILTER_PATH")? {
        config = config.with_dupefilter_path(path);
    }
    if let Some(name) = settings.get_opt::<String>("SCHEDULER_TYPE")? {
        let scheduler_type =
            name.parse::<SchedulerType>()
                .map_err(|e| SettingsError::InvalidValue {
                    key: "SCHEDULER_TYPE".to_string(),
                    message: e.to_string(),
                })?;
        config = config.with_scheduler_type(scheduler_type);
    }
    if let Some(retry_times) = settings.get_opt("RETRY_TIMES")? {
        config = config.with_retry_times(retry_times);
    }
    if let Some(max_redirects) = settings.get_opt("REDIRECT_MAX_TIMES")? {
        config = config.with_redirect_max_times(max_redirects);
    }
    if let Some(depth_limit) = settings.get_opt("DEPTH_LIMIT")? {
        config = config.with_depth_limit(depth_limit);
    }
    if let Some(interval) = seconds(settings, "LOGSTATS_INTERVAL")? {
        let interval = (!interval.is_zero()).then_some(interval);
        config = config.with_log_stats_interval(interval);
    }

    Ok(config)
}
