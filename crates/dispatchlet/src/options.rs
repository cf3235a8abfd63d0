//! Dispatcher configuration and the worker command-line contract.
//!
//! The parent launches every worker with
//! `--is-child-process true --process-id <i> --service-initializer-path <p>`
//! plus any user-provided pass-through arguments. Values are separate argv
//! entries, so paths with spaces need no quoting. [`WorkerArgs`] is the
//! worker-side parse of that command line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::endpoint::{CurrentExeSpawner, WorkerSpawner};
use crate::error::DispatcherError;

pub(crate) const IS_CHILD_PROCESS_FLAG: &str = "--is-child-process";
pub(crate) const PROCESS_ID_FLAG: &str = "--process-id";
pub(crate) const INITIALIZER_PATH_FLAG: &str = "--service-initializer-path";
pub(crate) const INITIALIZER_CLASS_FLAG: &str = "--service-initializer-class-name";

/// Options for [`crate::Dispatcher::create_instance`].
#[derive(Clone)]
pub struct DispatcherOptions {
    process_count: usize,
    service_initializer_path: PathBuf,
    service_initializer_class_name: Option<String>,
    worker_args: Vec<(String, String)>,
    spawner: Arc<dyn WorkerSpawner>,
}

impl DispatcherOptions {
    pub fn new(service_initializer_path: impl Into<PathBuf>) -> Self {
        Self {
            process_count: 1,
            service_initializer_path: service_initializer_path.into(),
            service_initializer_class_name: None,
            worker_args: Vec::new(),
            spawner: Arc::new(CurrentExeSpawner),
        }
    }

    /// Pool size. Coerced to at least one worker.
    pub fn with_process_count(mut self, count: usize) -> Self {
        self.process_count = count.max(1);
        self
    }

    pub fn with_initializer_class_name(mut self, name: impl Into<String>) -> Self {
        self.service_initializer_class_name = Some(name.into());
        self
    }

    /// Extra `--key value` pair forwarded verbatim to every worker.
    pub fn with_worker_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.worker_args.push((key.into(), value.into()));
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn process_count(&self) -> usize {
        self.process_count
    }

    pub fn service_initializer_path(&self) -> &Path {
        &self.service_initializer_path
    }

    pub fn service_initializer_class_name(&self) -> Option<&str> {
        self.service_initializer_class_name.as_deref()
    }

    pub(crate) fn spawner(&self) -> &dyn WorkerSpawner {
        self.spawner.as_ref()
    }

    /// Construction-time check: a missing initializer path fails fast, long
    /// before the first worker would trip over it.
    pub(crate) fn validate(&self) -> Result<(), DispatcherError> {
        if !self.service_initializer_path.exists() {
            return Err(DispatcherError::Initializer(format!(
                "service initializer path does not exist: {}",
                self.service_initializer_path.display()
            )));
        }
        Ok(())
    }

    /// The argv a worker with the given index is launched with.
    pub(crate) fn worker_command_args(&self, process_id: usize) -> Vec<String> {
        let mut args = vec![
            IS_CHILD_PROCESS_FLAG.to_string(),
            "true".to_string(),
            PROCESS_ID_FLAG.to_string(),
            process_id.to_string(),
            INITIALIZER_PATH_FLAG.to_string(),
            self.service_initializer_path.to_string_lossy().into_owned(),
        ];
        if let Some(class_name) = &self.service_initializer_class_name {
            args.push(INITIALIZER_CLASS_FLAG.to_string());
            args.push(class_name.clone());
        }
        for (key, value) in &self.worker_args {
            args.push(format!("--{}", key.trim_start_matches('-')));
            args.push(value.clone());
        }
        args
    }
}

impl std::fmt::Debug for DispatcherOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherOptions")
            .field("process_count", &self.process_count)
            .field("service_initializer_path", &self.service_initializer_path)
            .field(
                "service_initializer_class_name",
                &self.service_initializer_class_name,
            )
            .field("worker_args", &self.worker_args)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerArgsError {
    #[error("flag '{0}' is missing its value")]
    MissingValue(String),
    #[error("required worker argument '{0}' is absent")]
    MissingArgument(&'static str),
    #[error("invalid process id '{0}'")]
    InvalidProcessId(String),
}

/// Worker-side view of the launch command line.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub process_id: usize,
    pub service_initializer_path: PathBuf,
    pub service_initializer_class_name: Option<String>,
    /// Pass-through arguments, keyed without the leading dashes.
    pub extra: HashMap<String, String>,
}

impl WorkerArgs {
    /// Parse a command line. Returns `Ok(None)` when the process was not
    /// launched as a worker (`--is-child-process true` absent), so a
    /// single-binary embedder can branch between parent and worker roles.
    pub fn parse(args: &[String]) -> Result<Option<Self>, WorkerArgsError> {
        let mut pairs = HashMap::new();
        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            if !arg.starts_with("--") {
                continue;
            }
            let value = iter
                .next()
                .ok_or_else(|| WorkerArgsError::MissingValue(arg.clone()))?;
            pairs.insert(arg.trim_start_matches('-').to_string(), value.clone());
        }

        if pairs.remove("is-child-process").as_deref() != Some("true") {
            return Ok(None);
        }

        let process_id = pairs
            .remove("process-id")
            .ok_or(WorkerArgsError::MissingArgument("process-id"))?;
        let process_id = process_id
            .parse()
            .map_err(|_| WorkerArgsError::InvalidProcessId(process_id.clone()))?;
        let service_initializer_path = pairs
            .remove("service-initializer-path")
            .ok_or(WorkerArgsError::MissingArgument("service-initializer-path"))?
            .into();
        let service_initializer_class_name = pairs.remove("service-initializer-class-name");

        Ok(Some(Self {
            process_id,
            service_initializer_path,
            service_initializer_class_name,
            extra: pairs,
        }))
    }

    /// Parse the current process's command line.
    pub fn from_env() -> Result<Option<Self>, WorkerArgsError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::parse(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_count_is_coerced_to_at_least_one() {
        let options = DispatcherOptions::new("/tmp/init.rs").with_process_count(0);
        assert_eq!(options.process_count(), 1);

        let options = DispatcherOptions::new("/tmp/init.rs").with_process_count(8);
        assert_eq!(options.process_count(), 8);
    }

    #[test]
    fn worker_command_args_roundtrip_through_parse() {
        let options = DispatcherOptions::new("/opt/services/init module.rs")
            .with_initializer_class_name("AppServices")
            .with_worker_arg("region", "eu-west-1");

        let args = options.worker_command_args(3);
        let parsed = WorkerArgs::parse(&args).unwrap().unwrap();

        assert_eq!(parsed.process_id, 3);
        assert_eq!(
            parsed.service_initializer_path,
            PathBuf::from("/opt/services/init module.rs")
        );
        assert_eq!(
            parsed.service_initializer_class_name.as_deref(),
            Some("AppServices")
        );
        assert_eq!(parsed.extra.get("region").map(String::as_str), Some("eu-west-1"));
    }

    #[test]
    fn non_worker_command_line_parses_to_none() {
        let args = vec!["--verbose".to_string(), "true".to_string()];
        assert!(WorkerArgs::parse(&args).unwrap().is_none());

        let args = vec![
            "--is-child-process".to_string(),
            "false".to_string(),
        ];
        assert!(WorkerArgs::parse(&args).unwrap().is_none());
    }

    #[test]
    fn missing_required_arguments_are_reported() {
        let args = vec!["--is-child-process".to_string(), "true".to_string()];
        assert!(matches!(
            WorkerArgs::parse(&args),
            Err(WorkerArgsError::MissingArgument("process-id"))
        ));

        let args = vec![
            "--is-child-process".to_string(),
            "true".to_string(),
            "--process-id".to_string(),
            "not-a-number".to_string(),
            "--service-initializer-path".to_string(),
            "/tmp/x".to_string(),
        ];
        assert!(matches!(
            WorkerArgs::parse(&args),
            Err(WorkerArgsError::InvalidProcessId(_))
        ));
    }

    #[test]
    fn validate_rejects_missing_initializer_path() {
        let options = DispatcherOptions::new("/definitely/not/a/real/path.rs");
        assert!(matches!(
            options.validate(),
            Err(DispatcherError::Initializer(_))
        ));
    }
}
