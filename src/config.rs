use crate::{
    mirror::{
        RunOptions,
        options::{DEFAULT_MAX_PASSES, DEFAULT_STATS_INTERVAL, DEFAULT_WORKERS},
    },
    services::registry::TargetSettings,
};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use tracing::warn;

const ENV_PREFIX: &str = "BUCKET_MIRROR_";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_TARGET_NAMESPACE: &str = "backup";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub manifest: PathBuf,
    pub target_endpoint: String,
    pub target_access_key: String,
    pub target_secret_key: String,
    pub target_region: String,
    pub target_prefix: String,
    pub target_namespace: String,
    pub num_workers: usize,
    pub stats_interval: Duration,
    pub max_passes: u32,
    pub status_addr: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Incremental bucket-to-bucket backup")]
pub struct Args {
    /// JSON manifest of bucket claims (overrides BUCKET_MIRROR_MANIFEST)
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Backup endpoint URL, or file:///path (overrides BUCKET_MIRROR_TARGET_ENDPOINT)
    #[arg(long)]
    pub target_endpoint: Option<String>,

    /// Backup access key (overrides BUCKET_MIRROR_TARGET_ACCESS_KEY)
    #[arg(long)]
    pub target_access_key: Option<String>,

    /// Backup region (overrides BUCKET_MIRROR_TARGET_REGION)
    #[arg(long)]
    pub target_region: Option<String>,

    /// Prefix of backup bucket names (overrides BUCKET_MIRROR_TARGET_PREFIX)
    #[arg(long)]
    pub target_prefix: Option<String>,

    /// Namespace of backup bucket identities (overrides BUCKET_MIRROR_TARGET_NAMESPACE)
    #[arg(long)]
    pub target_namespace: Option<String>,

    /// Workers for filter, load and upload (overrides BUCKET_MIRROR_NUM_WORKERS)
    #[arg(long)]
    pub num_workers: Option<usize>,

    /// Seconds between stats reports, 0 disables (overrides BUCKET_MIRROR_STATS_INTERVAL)
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Passes per bucket pair (overrides BUCKET_MIRROR_MAX_PASSES)
    #[arg(long)]
    pub max_passes: Option<u32>,

    /// Address for /healthz, /readyz and /stats (overrides BUCKET_MIRROR_STATUS_ADDR)
    #[arg(long)]
    pub status_addr: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_sources(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over variables read through `lookup`. CLI wins.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.is_empty());
        let required = |value: Option<String>, suffix: &str| {
            value.or_else(|| var(suffix)).ok_or_else(|| {
                anyhow!(
                    "missing {ENV_PREFIX}{suffix} (or --{})",
                    suffix.to_lowercase().replace('_', "-")
                )
            })
        };

        let manifest = match args.manifest {
            Some(path) => path,
            None => PathBuf::from(required(None, "MANIFEST")?),
        };
        let target_endpoint = required(args.target_endpoint, "TARGET_ENDPOINT")?;
        let target_access_key = required(args.target_access_key, "TARGET_ACCESS_KEY")?;
        // Secrets only come from the environment.
        let target_secret_key = var("TARGET_SECRET_KEY")
            .context("missing BUCKET_MIRROR_TARGET_SECRET_KEY")?;
        let target_prefix = required(args.target_prefix, "TARGET_PREFIX")?;

        let target_region = args
            .target_region
            .or_else(|| var("TARGET_REGION"))
            .unwrap_or_else(|| DEFAULT_REGION.into());
        let target_namespace = args
            .target_namespace
            .or_else(|| var("TARGET_NAMESPACE"))
            .unwrap_or_else(|| DEFAULT_TARGET_NAMESPACE.into());

        let num_workers = match args.num_workers {
            Some(n) if n > 0 => n,
            Some(_) => {
                warn!("--num-workers must be positive, using {DEFAULT_WORKERS}");
                DEFAULT_WORKERS
            }
            None => match var("NUM_WORKERS").map(|v| v.parse::<usize>()) {
                Some(Ok(n)) if n > 0 => n,
                Some(_) => {
                    warn!("invalid {ENV_PREFIX}NUM_WORKERS, using {DEFAULT_WORKERS}");
                    DEFAULT_WORKERS
                }
                None => DEFAULT_WORKERS,
            },
        };

        let stats_interval = match args.stats_interval {
            Some(secs) => Duration::from_secs(secs),
            None => parse_var(&var, "STATS_INTERVAL")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STATS_INTERVAL),
        };
        let max_passes = match args.max_passes {
            Some(passes) => passes,
            None => parse_var(&var, "MAX_PASSES")?.unwrap_or(DEFAULT_MAX_PASSES),
        }
        .max(1);

        Ok(Self {
            manifest,
            target_endpoint,
            target_access_key,
            target_secret_key,
            target_region,
            target_prefix,
            target_namespace,
            num_workers,
            stats_interval,
            max_passes,
            status_addr: args.status_addr.or_else(|| var("STATUS_ADDR")),
        })
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions::default()
            .with_workers(self.num_workers)
            .with_stats_interval(self.stats_interval)
            .with_max_passes(self.max_passes)
    }

    pub fn target_settings(&self) -> TargetSettings {
        TargetSettings {
            endpoint: self.target_endpoint.clone(),
            access_key_id: self.target_access_key.clone(),
            secret_access_key: self.target_secret_key.clone(),
            region: self.target_region.clone(),
            bucket_prefix: self.target_prefix.clone(),
            namespace: self.target_namespace.clone(),
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, suffix: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(suffix)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {ENV_PREFIX}{suffix} value `{value}`"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("BUCKET_MIRROR_MANIFEST", "/etc/claims.json"),
        ("BUCKET_MIRROR_TARGET_ENDPOINT", "http://backup:9000"),
        ("BUCKET_MIRROR_TARGET_ACCESS_KEY", "AK"),
        ("BUCKET_MIRROR_TARGET_SECRET_KEY", "SK"),
        ("BUCKET_MIRROR_TARGET_PREFIX", "backup"),
    ];

    #[test]
    fn defaults_apply() {
        let cfg = AppConfig::from_sources(Args::default(), env(BASE)).unwrap();
        assert_eq!(cfg.num_workers, 16);
        assert_eq!(cfg.max_passes, 3);
        assert_eq!(cfg.stats_interval, Duration::from_secs(60));
        assert_eq!(cfg.target_region, "us-east-1");
        assert_eq!(cfg.target_namespace, "backup");
        assert!(cfg.status_addr.is_none());
    }

    #[test]
    fn invalid_worker_count_falls_back() {
        let mut vars = BASE.to_vec();
        vars.push(("BUCKET_MIRROR_NUM_WORKERS", "lots"));
        let cfg = AppConfig::from_sources(Args::default(), env(&vars)).unwrap();
        assert_eq!(cfg.num_workers, 16);
    }

    #[test]
    fn cli_overrides_environment() {
        let mut vars = BASE.to_vec();
        vars.push(("BUCKET_MIRROR_NUM_WORKERS", "4"));
        let args = Args {
            num_workers: Some(8),
            target_prefix: Some("dr".into()),
            ..Args::default()
        };
        let cfg = AppConfig::from_sources(args, env(&vars)).unwrap();
        assert_eq!(cfg.num_workers, 8);
        assert_eq!(cfg.target_settings().bucket_prefix, "dr");
        assert_eq!(cfg.run_options().workers, 8);
    }

    #[test]
    fn bad_interval_is_an_error() {
        let mut vars = BASE.to_vec();
        vars.push(("BUCKET_MIRROR_STATS_INTERVAL", "soon"));
        let err = AppConfig::from_sources(Args::default(), env(&vars)).unwrap_err();
        assert!(err.to_string().contains("BUCKET_MIRROR_STATS_INTERVAL"));
    }

    #[test]
    fn missing_manifest_is_reported() {
        let err = AppConfig::from_sources(Args::default(), env(&BASE[1..])).unwrap_err();
        assert!(err.to_string().contains("BUCKET_MIRROR_MANIFEST"));
    }
}
