//! Orchestrator configuration.
//!
//! Built once at startup and shared as `Arc<WorkerConfig>`; nothing mutates
//! it afterwards.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use atelier_core::command::CommandTemplate;
use atelier_core::error::CoreError;
use atelier_core::job_class::JobClass;
use atelier_core::types::DbId;

/// Name of the side-channel progress file inside a job's scratch dir.
pub const PROGRESS_FILE_NAME: &str = "progress";

/// What counts as activity for the idle watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleActivity {
    /// Any stdout/stderr line refreshes the idle timer.
    AnyOutput,
    /// Only parsed progress events refresh it.
    ProgressOnly,
}

impl FromStr for IdleActivity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any_output" => Ok(Self::AnyOutput),
            "progress_only" => Ok(Self::ProgressOnly),
            _ => Err(CoreError::Validation(format!(
                "Invalid idle activity: '{s}'. Must be one of: any_output, progress_only"
            ))),
        }
    }
}

/// Per-class execution settings.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    pub command: CommandTemplate,
    pub wall_clock_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_concurrency: usize,
    pub idle_activity: IdleActivity,
}

impl ClassConfig {
    /// Built-in defaults for a class.
    pub fn defaults_for(class: JobClass) -> Self {
        let wall_clock_secs = match class {
            JobClass::Generation => 3_600,
            JobClass::Training => 86_400,
            JobClass::Scraping | JobClass::Labeling => 7_200,
        };
        Self {
            command: default_command(class),
            wall_clock_timeout: Duration::from_secs(wall_clock_secs),
            idle_timeout: Duration::from_secs(300),
            max_concurrency: 1,
            idle_activity: IdleActivity::AnyOutput,
        }
    }
}

/// Process-wide orchestrator configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root for per-job log files (`<log_dir>/<class>/<id>.log`).
    pub log_dir: PathBuf,
    /// Root for job artifacts (`<output_dir>/<class>/<id>`).
    pub output_dir: PathBuf,
    /// Root for per-job scratch space (`<scratch_dir>/<id>`).
    pub scratch_dir: PathBuf,
    /// JSON-lines artifact index appended to on completion.
    pub index_path: PathBuf,
    /// Dispatcher and supervisor tick.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL when terminating a worker.
    pub kill_grace: Duration,
    /// Capacity of the channel between output readers and the supervisor.
    pub output_channel_capacity: usize,
    pub generation: ClassConfig,
    pub training: ClassConfig,
    pub scraping: ClassConfig,
    pub labeling: ClassConfig,
}

impl WorkerConfig {
    /// Defaults with every directory placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let output_dir = root.join("outputs");
        Self {
            log_dir: root.join("logs"),
            index_path: output_dir.join("index.jsonl"),
            output_dir,
            scratch_dir: root.join("scratch"),
            poll_interval: Duration::from_millis(1_000),
            kill_grace: Duration::from_secs(10),
            output_channel_capacity: 256,
            generation: ClassConfig::defaults_for(JobClass::Generation),
            training: ClassConfig::defaults_for(JobClass::Training),
            scraping: ClassConfig::defaults_for(JobClass::Scraping),
            labeling: ClassConfig::defaults_for(JobClass::Labeling),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                                   | Default                        |
    /// |-------------------------------------------|--------------------------------|
    /// | `ATELIER_LOG_DIR`                         | `./data/logs`                  |
    /// | `ATELIER_OUTPUT_DIR`                      | `./data/outputs`               |
    /// | `ATELIER_SCRATCH_DIR`                     | `./data/scratch`               |
    /// | `ATELIER_INDEX_PATH`                      | `<output dir>/index.jsonl`     |
    /// | `ATELIER_POLL_INTERVAL_MS`                | `1000`                         |
    /// | `ATELIER_KILL_GRACE_SECS`                 | `10`                           |
    /// | `ATELIER_OUTPUT_CHANNEL_CAPACITY`         | `256`                          |
    /// | `ATELIER_<CLASS>_COMMAND`                 | `python3 workers/<class>.py …` |
    /// | `ATELIER_<CLASS>_WALL_CLOCK_TIMEOUT_SECS` | per class, see [`ClassConfig::defaults_for`] |
    /// | `ATELIER_<CLASS>_IDLE_TIMEOUT_SECS`       | `300`                          |
    /// | `ATELIER_<CLASS>_MAX_CONCURRENCY`         | `1`                            |
    /// | `ATELIER_<CLASS>_IDLE_ACTIVITY`           | `any_output`                   |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let mut config = Self::rooted_at(Path::new("./data"));

        if let Some(dir) = lookup("ATELIER_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ATELIER_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ATELIER_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }
        config.index_path = match lookup("ATELIER_INDEX_PATH") {
            Some(path) => PathBuf::from(path),
            None => config.output_dir.join("index.jsonl"),
        };

        config.poll_interval = Duration::from_millis(parse_var(
            &lookup,
            "ATELIER_POLL_INTERVAL_MS",
            1_000u64,
        )?);
        config.kill_grace = Duration::from_secs(parse_var(&lookup, "ATELIER_KILL_GRACE_SECS", 10u64)?);
        config.output_channel_capacity =
            parse_var(&lookup, "ATELIER_OUTPUT_CHANNEL_CAPACITY", 256usize)?;

        for class in JobClass::ALL {
            let prefix = format!("ATELIER_{}", class.env_prefix());
            let defaults = ClassConfig::defaults_for(class);

            let command = match lookup(&format!("{prefix}_COMMAND")) {
                Some(line) => CommandTemplate::parse(&line).map_err(|e| {
                    CoreError::Validation(format!("{prefix}_COMMAND: {e}"))
                })?,
                None => defaults.command,
            };
            let wall_clock_secs = parse_var(
                &lookup,
                &format!("{prefix}_WALL_CLOCK_TIMEOUT_SECS"),
                defaults.wall_clock_timeout.as_secs(),
            )?;
            let idle_secs = parse_var(
                &lookup,
                &format!("{prefix}_IDLE_TIMEOUT_SECS"),
                defaults.idle_timeout.as_secs(),
            )?;

            *config.class_mut(class) = ClassConfig {
                command,
                wall_clock_timeout: Duration::from_secs(wall_clock_secs),
                idle_timeout: Duration::from_secs(idle_secs),
                max_concurrency: parse_var(
                    &lookup,
                    &format!("{prefix}_MAX_CONCURRENCY"),
                    defaults.max_concurrency,
                )?,
                idle_activity: parse_var(
                    &lookup,
                    &format!("{prefix}_IDLE_ACTIVITY"),
                    defaults.idle_activity,
                )?,
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.poll_interval.is_zero() {
            return Err(CoreError::Validation(
                "ATELIER_POLL_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.output_channel_capacity == 0 {
            return Err(CoreError::Validation(
                "ATELIER_OUTPUT_CHANNEL_CAPACITY must be greater than 0".to_string(),
            ));
        }
        for class in JobClass::ALL {
            let prefix = format!("ATELIER_{}", class.env_prefix());
            let cfg = self.class(class);
            if cfg.max_concurrency == 0 {
                return Err(CoreError::Validation(format!(
                    "{prefix}_MAX_CONCURRENCY must be at least 1"
                )));
            }
            if cfg.wall_clock_timeout.is_zero() {
                return Err(CoreError::Validation(format!(
                    "{prefix}_WALL_CLOCK_TIMEOUT_SECS must be greater than 0"
                )));
            }
            if cfg.idle_timeout.is_zero() {
                return Err(CoreError::Validation(format!(
                    "{prefix}_IDLE_TIMEOUT_SECS must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    pub fn class(&self, class: JobClass) -> &ClassConfig {
        match class {
            JobClass::Generation => &self.generation,
            JobClass::Training => &self.training,
            JobClass::Scraping => &self.scraping,
            JobClass::Labeling => &self.labeling,
        }
    }

    pub fn class_mut(&mut self, class: JobClass) -> &mut ClassConfig {
        match class {
            JobClass::Generation => &mut self.generation,
            JobClass::Training => &mut self.training,
            JobClass::Scraping => &mut self.scraping,
            JobClass::Labeling => &mut self.labeling,
        }
    }

    // ---------- Per-job paths ----------

    pub fn job_output_dir(&self, class: JobClass, id: DbId) -> PathBuf {
        self.output_dir.join(class.as_str()).join(id.to_string())
    }

    pub fn job_scratch_dir(&self, id: DbId) -> PathBuf {
        self.scratch_dir.join(id.to_string())
    }

    pub fn job_progress_file(&self, id: DbId) -> PathBuf {
        self.job_scratch_dir(id).join(PROGRESS_FILE_NAME)
    }

    pub fn job_log_path(&self, class: JobClass, id: DbId) -> PathBuf {
        self.log_dir.join(class.as_str()).join(format!("{id}.log"))
    }
}

fn default_command(class: JobClass) -> CommandTemplate {
    CommandTemplate::new(
        "python3",
        vec![
            format!("workers/{}.py", class.as_str()),
            "--params".to_string(),
            "{params_json}".to_string(),
            "--out".to_string(),
            "{output_dir}".to_string(),
            "--progress".to_string(),
            "{progress_file}".to_string(),
        ],
    )
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Validation(format!("{key} is invalid ('{raw}'): {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = WorkerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("./data/logs"));
        assert_eq!(config.index_path, PathBuf::from("./data/outputs/index.jsonl"));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.kill_grace, Duration::from_secs(10));
        assert_eq!(config.training.wall_clock_timeout, Duration::from_secs(86_400));
        assert_eq!(config.generation.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.scraping.max_concurrency, 1);
        assert_eq!(
            config.labeling.command.placeholders(),
            vec!["output_dir", "params_json", "progress_file"]
        );
    }

    #[test]
    fn per_class_overrides() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("ATELIER_GENERATION_COMMAND", "sh -c 'echo {prompt}'"),
            ("ATELIER_TRAINING_IDLE_TIMEOUT_SECS", "900"),
            ("ATELIER_SCRAPING_MAX_CONCURRENCY", "2"),
            ("ATELIER_LABELING_IDLE_ACTIVITY", "progress_only"),
            ("ATELIER_OUTPUT_DIR", "/srv/out"),
        ]))
        .unwrap();
        assert_eq!(config.generation.command.program, "sh");
        assert_eq!(config.generation.command.args, vec!["-c", "echo {prompt}"]);
        assert_eq!(config.training.idle_timeout, Duration::from_secs(900));
        assert_eq!(config.scraping.max_concurrency, 2);
        assert_eq!(config.labeling.idle_activity, IdleActivity::ProgressOnly);
        assert_eq!(config.index_path, PathBuf::from("/srv/out/index.jsonl"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = WorkerConfig::from_lookup(lookup_from(&[("ATELIER_KILL_GRACE_SECS", "soon")]))
            .unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("ATELIER_KILL_GRACE_SECS"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = WorkerConfig::from_lookup(lookup_from(&[(
            "ATELIER_GENERATION_MAX_CONCURRENCY",
            "0",
        )]))
        .unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("MAX_CONCURRENCY"));
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(WorkerConfig::from_lookup(lookup_from(&[(
            "ATELIER_TRAINING_WALL_CLOCK_TIMEOUT_SECS",
            "0",
        )]))
        .is_err());
    }

    #[test]
    fn job_paths() {
        let config = WorkerConfig::rooted_at(Path::new("/data"));
        assert_eq!(
            config.job_output_dir(JobClass::Training, 9),
            PathBuf::from("/data/outputs/training/9")
        );
        assert_eq!(config.job_progress_file(9), PathBuf::from("/data/scratch/9/progress"));
        assert_eq!(
            config.job_log_path(JobClass::Training, 9),
            PathBuf::from("/data/logs/training/9.log")
        );
    }
}
