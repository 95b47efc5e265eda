//! Pipeline configuration.
//!
//! Options can come from a JSON file, from `TELEFLOW_*` environment
//! variables, or both: [`PipelineOptions::load`] reads the file named
//! by `TELEFLOW_CONFIG` first and lets the environment override it.
//!
//! Template parameters are free-form string pairs. In the environment
//! they are spelled `TELEFLOW_PARAM_<name>`, e.g.
//! `TELEFLOW_PARAM_inputFilePattern=gs://bucket/*.csv`.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::dataflow::WorkerCount;

pub const ENV_PREFIX: &str = "TELEFLOW_";
const PARAM_PREFIX: &str = "TELEFLOW_PARAM_";

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("missing required parameter {0:?}")]
    MissingParameter(String),
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error("can't read options file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't parse options JSON")]
    Parse(#[from] serde_json::Error),
    #[error("invalid topology: {0}")]
    Topology(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineOptions {
    pub job_name: String,
    /// Number of processes in the cluster.
    pub processes: usize,
    pub workers_per_process: usize,
    /// Index of this process. Only set when running one process of a
    /// cluster.
    pub process_id: Option<usize>,
    /// `host:port` of every process, in process order.
    pub addresses: Vec<String>,
    /// Where each worker writes its dead-letter DB. Dead letters are
    /// kept in memory if unset.
    pub dead_letter_dir: Option<PathBuf>,
    /// Defaults to `ERROR`.
    pub log_level: Option<String>,
    /// OTLP collector URL. Traces are only exported when this is set.
    pub otlp_endpoint: Option<String>,
    pub sampling_ratio: f64,
    /// Port of the `/metrics` server. No server is started if unset.
    pub metrics_port: Option<u16>,
    pub parameters: BTreeMap<String, String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            job_name: "teleflow".to_string(),
            processes: 1,
            workers_per_process: 1,
            process_id: None,
            addresses: Vec::new(),
            dead_letter_dir: None,
            log_level: None,
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            metrics_port: None,
            parameters: BTreeMap::new(),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, OptionsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| OptionsError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}

impl PipelineOptions {
    /// Read the file named by `TELEFLOW_CONFIG`, if any, then apply the
    /// environment on top.
    pub fn load() -> Result<Self, OptionsError> {
        let base = match std::env::var_os("TELEFLOW_CONFIG") {
            Some(path) => Self::from_json_file(Path::new(&path))?,
            None => Self::default(),
        };
        base.with_vars(std::env::vars())
    }

    pub fn from_json_file(path: &Path) -> Result<Self, OptionsError> {
        let json = std::fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn from_json_str(json: &str) -> Result<Self, OptionsError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Override fields from `TELEFLOW_*` variables. Unrelated
    /// variables are ignored.
    pub fn with_vars(
        mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, OptionsError> {
        for (name, value) in vars {
            if let Some(param) = name.strip_prefix(PARAM_PREFIX) {
                self.parameters.insert(param.to_string(), value);
                continue;
            }
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "JOB_NAME" => self.job_name = value,
                "PROCESSES" => self.processes = parse_var(&name, &value)?,
                "WORKERS_PER_PROCESS" => self.workers_per_process = parse_var(&name, &value)?,
                "PROCESS_ID" => self.process_id = Some(parse_var(&name, &value)?),
                "ADDRESSES" => {
                    self.addresses = value
                        .split(',')
                        .map(str::trim)
                        .filter(|addr| !addr.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "DEAD_LETTER_DIR" => self.dead_letter_dir = Some(PathBuf::from(value)),
                "LOG" => self.log_level = Some(value),
                "OTLP_ENDPOINT" => self.otlp_endpoint = Some(value),
                "SAMPLING_RATIO" => self.sampling_ratio = parse_var(&name, &value)?,
                "METRICS_PORT" => self.metrics_port = Some(parse_var(&name, &value)?),
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.processes == 0 {
            return Err(OptionsError::Topology("processes must be > 0".into()));
        }
        if self.workers_per_process == 0 {
            return Err(OptionsError::Topology(
                "workers_per_process must be > 0".into(),
            ));
        }
        if let Some(proc_id) = self.process_id {
            if proc_id >= self.processes {
                return Err(OptionsError::Topology(format!(
                    "process_id {proc_id} is out of range for {} processes",
                    self.processes
                )));
            }
            if self.addresses.len() != self.processes {
                return Err(OptionsError::Topology(format!(
                    "{} addresses given for {} processes",
                    self.addresses.len(),
                    self.processes
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(OptionsError::InvalidValue {
                name: "sampling_ratio".into(),
                value: self.sampling_ratio.to_string(),
                reason: "must be between 0 and 1".into(),
            });
        }
        Ok(())
    }

    /// Total number of workers across all processes.
    pub fn worker_count(&self) -> WorkerCount {
        WorkerCount(self.processes * self.workers_per_process)
    }

    pub fn parameter(&self, name: &str) -> Result<&str, OptionsError> {
        self.parameters
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| OptionsError::MissingParameter(name.to_string()))
    }

    pub fn optional_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Parse a required parameter.
    pub fn parse_parameter<T>(&self, name: &str) -> Result<T, OptionsError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        parse_var(name, self.parameter(name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_defaults() {
        let options = PipelineOptions::default()
            .with_vars(vars(&[
                ("TELEFLOW_JOB_NAME", "bulk-compress"),
                ("TELEFLOW_WORKERS_PER_PROCESS", "4"),
                ("TELEFLOW_DEAD_LETTER_DIR", "/tmp/dlq"),
                ("TELEFLOW_LOG", "debug"),
                ("TELEFLOW_PARAM_inputFilePattern", "gs://bucket/input/*.csv"),
                ("TELEFLOW_PARAM_compression", "GZIP"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();

        assert_eq!(options.job_name, "bulk-compress");
        assert_eq!(options.workers_per_process, 4);
        assert_eq!(options.worker_count(), WorkerCount(4));
        assert_eq!(options.dead_letter_dir, Some(PathBuf::from("/tmp/dlq")));
        assert_eq!(options.log_level.as_deref(), Some("debug"));
        assert_eq!(
            options.parameter("inputFilePattern").unwrap(),
            "gs://bucket/input/*.csv"
        );
        assert_eq!(options.optional_parameter("compression"), Some("GZIP"));
    }

    #[test]
    fn json_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(
            &path,
            r#"{
                "jobName": "replicate",
                "processes": 2,
                "processId": 1,
                "addresses": ["localhost:2101", "localhost:2102"],
                "metricsPort": 3030,
                "parameters": {"outputDirectory": "/out"}
            }"#,
        )
        .unwrap();

        let options = PipelineOptions::from_json_file(&path).unwrap();

        assert_eq!(options.job_name, "replicate");
        assert_eq!(options.process_id, Some(1));
        assert_eq!(options.workers_per_process, 1);
        assert_eq!(options.metrics_port, Some(3030));
        assert_eq!(options.parameter("outputDirectory").unwrap(), "/out");
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let options = PipelineOptions::default();

        assert!(matches!(
            options.parameter("outputDirectory"),
            Err(OptionsError::MissingParameter(name)) if name == "outputDirectory"
        ));
    }

    #[test]
    fn parse_parameter_reports_bad_values() {
        let options = PipelineOptions::default()
            .with_vars(vars(&[("TELEFLOW_PARAM_numShards", "many")]))
            .unwrap();

        assert!(matches!(
            options.parse_parameter::<u32>("numShards"),
            Err(OptionsError::InvalidValue { .. })
        ));
    }

    #[test]
    fn bad_topology_is_rejected() {
        let res = PipelineOptions::default().with_vars(vars(&[
            ("TELEFLOW_PROCESSES", "2"),
            ("TELEFLOW_PROCESS_ID", "0"),
            ("TELEFLOW_ADDRESSES", "localhost:2101"),
        ]));
        assert!(matches!(res, Err(OptionsError::Topology(_))));

        let res = PipelineOptions::default().with_vars(vars(&[("TELEFLOW_PROCESSES", "zero")]));
        assert!(matches!(res, Err(OptionsError::InvalidValue { .. })));
    }
}
