//! Recognized configuration keys (§6) loaded from a YAML file, with the
//! handful of operational knobs the teacher itself surfaced through
//! environment variables (`Config::from_env` in the teacher's `main.rs`)
//! overridable the same way.

use crate::errors::{CollectorError, Result};
use crate::rules::{RenameRules, RuleSet};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

fn default_readers_subprocesses() -> usize {
    1
}
fn default_job_timeout() -> u64 {
    1200
}
fn default_job_timeout_check_interval() -> u64 {
    120
}
fn default_job_metrics_update_interval() -> u64 {
    5
}
fn default_job_jids_cleanup_interval() -> u64 {
    30
}
fn default_metrics_timeout() -> u64 {
    120
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8216
}
fn default_backlog() -> u32 {
    128
}
fn default_num_processes() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameRulePair {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RenameRulesConfig {
    #[serde(default)]
    pub sls: Vec<RenameRulePair>,
    #[serde(default)]
    pub sid: Vec<RenameRulePair>,
    #[serde(default, rename = "mod")]
    pub mod_: Vec<RenameRulePair>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_num_processes")]
    pub num_processes: u32,
    #[serde(default)]
    pub disable_ssl: bool,
    pub ssl_crt: Option<String>,
    pub ssl_key: Option<String>,
    pub log_access_file: Option<String>,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        RestApiConfig {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            num_processes: default_num_processes(),
            disable_ssl: false,
            ssl_crt: None,
            ssl_key: None,
            log_access_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub events_regex_filter: String,
    #[serde(default)]
    pub events_additional: Vec<String>,
    #[serde(default = "default_readers_subprocesses")]
    pub readers_subprocesses: usize,
    #[serde(default)]
    pub rename_rules: RenameRulesConfig,
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
    #[serde(default = "default_job_timeout_check_interval")]
    pub job_timeout_check_interval: u64,
    #[serde(default = "default_job_metrics_update_interval")]
    pub job_metrics_update_interval: u64,
    #[serde(default = "default_job_jids_cleanup_interval")]
    pub job_jids_cleanup_interval: u64,
    #[serde(default = "default_metrics_timeout")]
    pub metrics_timeout: u64,
    pub sock_dir: Option<String>,
    pub ipc_write_buffer: Option<usize>,
    #[serde(default)]
    pub restapi: RestApiConfig,
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|source| CollectorError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| CollectorError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Compile the regexes and rename rules once, up front, so the parser
    /// pool and ingress filter only ever share read-only compiled state.
    pub fn compile(&self) -> Result<CompiledConfig> {
        let events_regex_filter =
            Regex::new(&self.events_regex_filter).map_err(|source| CollectorError::Regex {
                pattern: self.events_regex_filter.clone(),
                source,
            })?;

        let mut events_additional = Vec::with_capacity(self.events_additional.len());
        for pattern in &self.events_additional {
            events_additional.push(Regex::new(pattern).map_err(|source| CollectorError::Regex {
                pattern: pattern.clone(),
                source,
            })?);
        }

        let rename_rules = RenameRules {
            sls: RuleSet::compile(&to_pairs(&self.rename_rules.sls))?,
            sid: RuleSet::compile(&to_pairs(&self.rename_rules.sid))?,
            mod_: RuleSet::compile(&to_pairs(&self.rename_rules.mod_))?,
        };

        if !self.restapi.disable_ssl {
            let crt = self.restapi.ssl_crt.as_ref().ok_or_else(|| {
                CollectorError::Config(
                    "restapi.ssl_crt is required unless restapi.disable_ssl is set".to_string(),
                )
            })?;
            if !Path::new(crt).exists() {
                return Err(CollectorError::MissingCertificate(crt.clone()));
            }
            if let Some(key) = &self.restapi.ssl_key {
                if !Path::new(key).exists() {
                    return Err(CollectorError::MissingCertificate(key.clone()));
                }
            }
        }

        Ok(CompiledConfig {
            events_regex_filter,
            events_additional,
            readers_subprocesses: self.readers_subprocesses.max(1),
            rename_rules,
            job_timeout: self.job_timeout,
            job_timeout_check_interval: self.job_timeout_check_interval,
            job_metrics_update_interval: self.job_metrics_update_interval,
            job_jids_cleanup_interval: self.job_jids_cleanup_interval,
            metrics_timeout: self.metrics_timeout,
            restapi: self.restapi.clone(),
        })
    }
}

fn to_pairs(pairs: &[RenameRulePair]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|p| (p.pattern.clone(), p.replacement.clone()))
        .collect()
}

/// Startup-validated configuration: regexes compiled, certificate paths
/// checked to exist. Shared read-only (`Arc`) by every pipeline stage.
pub struct CompiledConfig {
    pub events_regex_filter: Regex,
    pub events_additional: Vec<Regex>,
    pub readers_subprocesses: usize,
    pub rename_rules: RenameRules,
    pub job_timeout: u64,
    pub job_timeout_check_interval: u64,
    pub job_metrics_update_interval: u64,
    pub job_jids_cleanup_interval: u64,
    pub metrics_timeout: u64,
    pub restapi: RestApiConfig,
}
