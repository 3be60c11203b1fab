use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.queue.max_concurrent_jobs == 0 {
        return Err(invalid("queue.maxConcurrentJobs must be at least 1"));
    }
    if config.queue.pending_scan_limit == 0 {
        return Err(invalid("queue.pendingScanLimit must be at least 1"));
    }

    if config.batch.sync_chunk_size == 0 || config.batch.categorize_chunk_size == 0 {
        return Err(invalid("batch chunk sizes must be at least 1"));
    }
    if config.batch.max_chunks_per_run == Some(0) {
        return Err(invalid("batch.maxChunksPerRun must be at least 1 when set"));
    }

    let categorizer = &config.categorizer;
    if categorizer.oracle_batch_size == 0 {
        return Err(invalid("categorizer.oracleBatchSize must be at least 1"));
    }
    if categorizer.max_attempts == 0 {
        return Err(invalid("categorizer.maxAttempts must be at least 1"));
    }
    if !(0.0..=1.0).contains(&categorizer.min_confidence) {
        return Err(invalid(format!(
            "categorizer.minConfidence must be within [0, 1], got {}",
            categorizer.min_confidence
        )));
    }
    if categorizer.max_prompt_candidates == Some(0) {
        return Err(invalid("categorizer.maxPromptCandidates must be at least 1 when set"));
    }

    if config.reaper.max_age_minutes <= 0 {
        return Err(invalid("reaper.maxAgeMinutes must be positive"));
    }

    let s = &config.scheduler;
    if [s.queue_secs, s.feeds_secs, s.categorize_secs, s.reaper_secs].contains(&0) {
        return Err(invalid("scheduler intervals must be at least one second"));
    }

    if config.oracle.endpoint.trim().is_empty() || config.oracle.model.trim().is_empty() {
        return Err(invalid("oracle.endpoint and oracle.model must not be empty"));
    }

    Ok(())
}
