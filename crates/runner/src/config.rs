#![forbid(unsafe_code)]

use crate::executors::CommandSpec;
use anyhow::{Context, bail};
use cx_core::StageName;
use cx_engine::{PipelineConfig, ReconcileConfig, ReplyFormat, WorkerPoolConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub(crate) pipeline: PipelineSection,
    pub(crate) dispatch: DispatchSection,
    pub(crate) reconcile: ReconcileSection,
    pub(crate) stages: BTreeMap<String, CommandSection>,
    pub(crate) reply: Option<CommandSection>,
    pub(crate) personas_file: Option<PathBuf>,
    pub(crate) artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PipelineSection {
    pub(crate) stage_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DispatchSection {
    pub(crate) workers: Option<usize>,
    pub(crate) poll_ms: Option<u64>,
    pub(crate) lease_ttl_ms: Option<u64>,
    pub(crate) retry_delay_ms: Option<u64>,
    pub(crate) max_deliveries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ReconcileSection {
    pub(crate) enabled: Option<bool>,
    pub(crate) interval_ms: Option<u64>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) batch_limit: Option<usize>,
    pub(crate) claims: Option<bool>,
    pub(crate) claim_ttl_ms: Option<u64>,
    pub(crate) public_base_url: Option<String>,
    pub(crate) max_reply_chars: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CommandSection {
    pub(crate) program: String,
    #[serde(default)]
    pub(crate) args: Vec<String>,
}

impl FileConfig {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub(crate) fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// Flags that take precedence over the file.
#[derive(Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) workers: Option<usize>,
    pub(crate) poll_ms: Option<u64>,
    pub(crate) no_reconcile: bool,
    pub(crate) public_base_url: Option<String>,
}

#[derive(Debug)]
pub(crate) struct RunnerConfig {
    pub(crate) pipeline: PipelineConfig,
    pub(crate) pool: WorkerPoolConfig,
    pub(crate) reconcile: ReconcileConfig,
    pub(crate) reconcile_enabled: bool,
    pub(crate) stages: BTreeMap<&'static str, CommandSpec>,
    pub(crate) reply: Option<CommandSpec>,
    pub(crate) personas_file: Option<PathBuf>,
    pub(crate) artifacts_dir: Option<PathBuf>,
}

fn command_spec(section: CommandSection, what: &str) -> anyhow::Result<CommandSpec> {
    let program = section.program.trim().to_string();
    if program.is_empty() {
        bail!("{what}: program must not be empty");
    }
    Ok(CommandSpec {
        program,
        args: section.args,
    })
}

fn positive_ms(value: Option<u64>, default: Duration, what: &str) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(0) => bail!("{what} must be greater than zero"),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

impl RunnerConfig {
    pub(crate) fn resolve(file: FileConfig, overrides: Overrides) -> anyhow::Result<Self> {
        let pipeline = PipelineConfig {
            stage_timeout: match file.pipeline.stage_timeout_ms {
                None | Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
            },
        };

        let defaults = WorkerPoolConfig::default();
        let workers = overrides
            .workers
            .or(file.dispatch.workers)
            .unwrap_or(defaults.workers);
        if workers == 0 {
            bail!("dispatch.workers must be at least 1");
        }
        let pool = WorkerPoolConfig {
            workers,
            worker_prefix: defaults.worker_prefix,
            poll_interval: positive_ms(
                overrides.poll_ms.or(file.dispatch.poll_ms),
                defaults.poll_interval,
                "dispatch.poll_ms",
            )?,
            lease_ttl: positive_ms(
                file.dispatch.lease_ttl_ms,
                defaults.lease_ttl,
                "dispatch.lease_ttl_ms",
            )?,
            retry_delay: file
                .dispatch
                .retry_delay_ms
                .map_or(defaults.retry_delay, Duration::from_millis),
            max_deliveries: file
                .dispatch
                .max_deliveries
                .unwrap_or(defaults.max_deliveries)
                .max(1),
        };

        let defaults = ReconcileConfig::default();
        let section = file.reconcile;
        let reconcile = ReconcileConfig {
            interval: positive_ms(section.interval_ms, defaults.interval, "reconcile.interval_ms")?,
            max_attempts: section
                .max_attempts
                .unwrap_or(defaults.max_attempts)
                .max(1),
            batch_limit: section.batch_limit.unwrap_or(defaults.batch_limit).max(1),
            claims: section.claims.unwrap_or(defaults.claims),
            claim_ttl: positive_ms(section.claim_ttl_ms, defaults.claim_ttl, "reconcile.claim_ttl_ms")?,
            claimant: defaults.claimant,
            reply: ReplyFormat {
                public_base_url: overrides
                    .public_base_url
                    .or(section.public_base_url)
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty()),
                max_chars: section
                    .max_reply_chars
                    .unwrap_or(defaults.reply.max_chars)
                    .max(1),
            },
        };
        let reconcile_enabled = !overrides.no_reconcile && section.enabled.unwrap_or(true);

        let mut stages = BTreeMap::new();
        for (name, section) in file.stages {
            let Some(stage) = StageName::ALL.into_iter().find(|s| s.key() == name) else {
                let known: Vec<&str> = StageName::ALL.iter().map(|s| s.key()).collect();
                bail!("unknown stage `{name}` (expected one of: {})", known.join(", "));
            };
            stages.insert(stage.key(), command_spec(section, &format!("stages.{name}"))?);
        }
        let reply = file
            .reply
            .map(|section| command_spec(section, "reply"))
            .transpose()?;

        Ok(Self {
            pipeline,
            pool,
            reconcile,
            reconcile_enabled,
            stages,
            reply,
            personas_file: file.personas_file,
            artifacts_dir: file.artifacts_dir,
        })
    }

    pub(crate) fn stage_command(&self, stage: StageName) -> anyhow::Result<CommandSpec> {
        self.stages.get(stage.key()).cloned().with_context(|| {
            format!("stage `{}` has no command configured ([stages.{}])", stage.key(), stage.key())
        })
    }
}
