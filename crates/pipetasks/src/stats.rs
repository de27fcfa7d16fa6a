use async_trait::async_trait;
use pipecore::{NodeContext, NodeError, Task, TaskConfig, Value};
use piperuntime::{TaskFactory, TaskMetadata};
use std::collections::{BTreeMap, HashMap};

const DEFAULT_DATASET: &str = "calexp";

/// Sigma-clipped statistics of a sample set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub mean: f64,
    pub mean_err: f64,
    pub std_dev: f64,
    pub std_dev_err: f64,
    /// Samples left after clipping
    pub used: usize,
}

/// Iteratively drop samples further than `num_sigma` standard deviations
/// from the mean, then compute mean and standard deviation of what is left.
pub fn sigma_clip(samples: &[f64], num_sigma: f64, num_iter: u64) -> Option<ClippedStats> {
    let mut kept: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
    if kept.is_empty() {
        return None;
    }

    for _ in 0..num_iter {
        let (mean, std_dev) = mean_and_std(&kept);
        if std_dev == 0.0 {
            break;
        }
        let limit = num_sigma * std_dev;
        let clipped: Vec<f64> = kept
            .iter()
            .copied()
            .filter(|x| (x - mean).abs() <= limit)
            .collect();
        if clipped.len() == kept.len() || clipped.is_empty() {
            break;
        }
        kept = clipped;
    }

    let (mean, std_dev) = mean_and_std(&kept);
    let n = kept.len() as f64;
    Some(ClippedStats {
        mean,
        mean_err: std_dev / n.sqrt(),
        std_dev,
        std_dev_err: if kept.len() > 1 {
            std_dev / (2.0 * (n - 1.0)).sqrt()
        } else {
            0.0
        },
        used: kept.len(),
    })
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// Clipping parameters shared by both stats tasks
#[derive(Debug, Clone)]
struct ClipConfig {
    num_sigma_clip: f64,
    num_iter: u64,
    dataset: String,
}

impl ClipConfig {
    fn from_config(config: &TaskConfig) -> Result<Self, NodeError> {
        let num_sigma_clip = config.get_f64("num_sigma_clip").unwrap_or(3.0);
        if num_sigma_clip <= 0.0 {
            return Err(NodeError::Configuration(format!(
                "num_sigma_clip must be positive, got {}",
                num_sigma_clip
            )));
        }
        Ok(Self {
            num_sigma_clip,
            num_iter: config.get_u64("num_iter").unwrap_or(2),
            dataset: config
                .get_str("dataset")
                .unwrap_or(DEFAULT_DATASET)
                .to_string(),
        })
    }

    fn defaults() -> TaskConfig {
        TaskConfig::new()
            .with("num_sigma_clip", 3.0)
            .with("num_iter", 2)
            .with("dataset", DEFAULT_DATASET)
    }

    /// Samples from the data store when running against a target, otherwise
    /// from the input slot (a number array, or an object with `samples`).
    /// A `dataset` kwarg on the target overrides the configured dataset.
    async fn samples(&self, ctx: &NodeContext) -> Result<Vec<f64>, NodeError> {
        let source = if ctx.target.is_some() {
            let dataset = ctx
                .kwarg("dataset")
                .and_then(Value::as_str)
                .unwrap_or(self.dataset.as_str());
            ctx.fetch(dataset).await?
        } else {
            match ctx.input.get("samples") {
                Some(samples) => samples.clone(),
                None => ctx.input.clone(),
            }
        };

        if source.is_null() {
            return Err(NodeError::MissingInput(format!("samples for '{}'", ctx.full_name)));
        }
        let samples = source.numbers();
        if samples.is_empty() {
            return Err(NodeError::InvalidInput(format!(
                "no numeric samples to process for '{}'",
                ctx.full_name
            )));
        }
        Ok(samples)
    }

    async fn clipped(&self, ctx: &mut NodeContext) -> Result<ClippedStats, NodeError> {
        let samples = self.samples(ctx).await?;
        let stats = sigma_clip(&samples, self.num_sigma_clip, self.num_iter).ok_or_else(|| {
            NodeError::ExecutionFailed("no finite samples left to process".to_string())
        })?;
        ctx.metadata.set("samples.total", samples.len() as u64);
        ctx.metadata.set("samples.used", stats.used as u64);
        Ok(stats)
    }
}

fn schema(fields: &[&str]) -> Value {
    Value::Json(serde_json::json!({ "fields": fields }))
}

/// Sigma-clipped mean of the samples
pub struct MeanTask {
    config: ClipConfig,
}

#[async_trait]
impl Task for MeanTask {
    fn task_type(&self) -> &str {
        "stats.mean"
    }

    async fn run(&mut self, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let stats = self.config.clipped(ctx).await?;
        ctx.events.info(format!(
            "clipped mean={:.2}; meanErr={:.2}",
            stats.mean, stats.mean_err
        ));
        ctx.metadata.set("mean", stats.mean);

        let mut out = HashMap::new();
        out.insert("mean".to_string(), Value::Number(stats.mean));
        out.insert("mean_err".to_string(), Value::Number(stats.mean_err));
        Ok(Value::Object(out))
    }

    fn schemas(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([("stats_mean".to_string(), schema(&["mean", "mean_err"]))])
    }
}

pub struct MeanTaskFactory;

impl TaskFactory for MeanTaskFactory {
    fn create(&self, config: &TaskConfig) -> Result<Box<dyn Task>, NodeError> {
        Ok(Box::new(MeanTask {
            config: ClipConfig::from_config(config)?,
        }))
    }

    fn task_type(&self) -> &str {
        "stats.mean"
    }

    fn default_config(&self) -> TaskConfig {
        ClipConfig::defaults()
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Sigma-clipped mean of a sample set".to_string(),
            category: "stats".to_string(),
        }
    }
}

/// Sigma-clipped standard deviation of the samples
pub struct StdTask {
    config: ClipConfig,
}

#[async_trait]
impl Task for StdTask {
    fn task_type(&self) -> &str {
        "stats.std"
    }

    async fn run(&mut self, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let stats = self.config.clipped(ctx).await?;
        ctx.events.info(format!(
            "stdDev={:.2}; stdDevErr={:.2}",
            stats.std_dev, stats.std_dev_err
        ));
        ctx.metadata.set("std_dev", stats.std_dev);

        let mut out = HashMap::new();
        out.insert("std_dev".to_string(), Value::Number(stats.std_dev));
        out.insert("std_dev_err".to_string(), Value::Number(stats.std_dev_err));
        Ok(Value::Object(out))
    }

    fn schemas(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([("stats_std".to_string(), schema(&["std_dev", "std_dev_err"]))])
    }
}

pub struct StdTaskFactory;

impl TaskFactory for StdTaskFactory {
    fn create(&self, config: &TaskConfig) -> Result<Box<dyn Task>, NodeError> {
        Ok(Box::new(StdTask {
            config: ClipConfig::from_config(config)?,
        }))
    }

    fn task_type(&self) -> &str {
        "stats.std"
    }

    fn default_config(&self) -> TaskConfig {
        ClipConfig::defaults()
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Sigma-clipped standard deviation of a sample set".to_string(),
            category: "stats".to_string(),
        }
    }
}
