use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::eval::{
    DEFAULT_IOU_THRESHOLD, DEFAULT_MIN_NAME_LEN, DEFAULT_NAME_SIM_THRESHOLD,
    DEFAULT_NUMERIC_TOLERANCE, DEFAULT_UNIT_SIM_THRESHOLD, ScoringConfig,
};
use crate::extractor::retry::RetryPolicy;
use crate::extractor::{ExtractorSettings, MAX_TIMEOUT_SEC};

#[derive(Parser, Debug)]
#[command(
    name = "dealeval",
    version,
    about = "Supermarket deal extraction scoring and benchmarking"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Score recorded predictions (JSON lines) against their ground truth.
    Score(ScoreArgs),
    /// Run one extractor over an annotated image dataset and score it.
    Run(RunArgs),
    /// Run several extractors side by side over the same dataset.
    Compare(CompareArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Provider {
    Ollama,
    Gemini,
    OpenaiCompatible,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
            Self::OpenaiCompatible => "openai-compatible",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Args, Debug, Clone)]
pub struct ScoringArgs {
    #[arg(long, default_value_t = DEFAULT_NAME_SIM_THRESHOLD)]
    pub name_sim_threshold: f64,

    #[arg(long, default_value_t = DEFAULT_UNIT_SIM_THRESHOLD)]
    pub unit_sim_threshold: f64,

    #[arg(long, default_value_t = DEFAULT_NUMERIC_TOLERANCE)]
    pub numeric_tolerance: f64,

    #[arg(long, default_value_t = DEFAULT_IOU_THRESHOLD)]
    pub iou_threshold: f64,

    #[arg(long, default_value_t = DEFAULT_MIN_NAME_LEN)]
    pub min_name_len: usize,
}

impl ScoringArgs {
    pub fn to_config(&self) -> Result<ScoringConfig> {
        let config = ScoringConfig {
            name_sim_threshold: self.name_sim_threshold,
            unit_sim_threshold: self.unit_sim_threshold,
            numeric_tolerance: self.numeric_tolerance,
            iou_threshold: self.iou_threshold,
            min_name_len: self.min_name_len,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[arg(long, default_value = "runs")]
    pub output_dir: PathBuf,

    #[arg(long)]
    pub max_samples: Option<usize>,

    #[arg(long, default_value_t = 5)]
    pub diag_max_samples: usize,
}

#[derive(Args, Debug, Clone)]
pub struct DatasetArgs {
    /// Directory holding `<name>/` image folders next to `<name>_annotated/` label folders.
    #[arg(long)]
    pub data_root: PathBuf,

    #[arg(long)]
    pub instruction_file: Option<PathBuf>,

    /// Extra text appended to the instruction for every sample.
    #[arg(long)]
    pub context: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct CallArgs {
    #[arg(long, default_value_t = MAX_TIMEOUT_SEC)]
    pub timeout_sec: u64,

    #[arg(long, default_value_t = 0.1)]
    pub temperature: f32,

    #[arg(long, default_value_t = 1024)]
    pub max_tokens: u32,

    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 30)]
    pub retry_delay_sec: u64,

    #[arg(long, value_enum, default_value_t = Backoff::Fixed)]
    pub backoff: Backoff,
}

impl CallArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_secs(self.retry_delay_sec),
            backoff: self.backoff,
        }
    }

    pub fn settings(
        &self,
        provider: Provider,
        model: &str,
        base_url: Option<String>,
        api_key: Option<String>,
    ) -> ExtractorSettings {
        ExtractorSettings {
            provider,
            model: model.to_string(),
            base_url,
            api_key,
            timeout: Duration::from_secs(self.timeout_sec),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ScoreArgs {
    /// Prediction file in JSON lines; repeat to compare several runs.
    #[arg(long = "predictions", required = true)]
    pub predictions: Vec<PathBuf>,

    #[command(flatten)]
    pub scoring: ScoringArgs,

    #[command(flatten)]
    pub report: ReportArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    #[arg(long, value_enum)]
    pub provider: Provider,

    #[arg(long)]
    pub model: String,

    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long)]
    pub api_key: Option<String>,

    #[command(flatten)]
    pub call: CallArgs,

    #[command(flatten)]
    pub scoring: ScoringArgs,

    #[command(flatten)]
    pub report: ReportArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// `<provider>:<model>`, e.g. `ollama:qwen2.5vl:7b`; repeat per configuration.
    #[arg(long = "target", required = true)]
    pub targets: Vec<String>,

    #[command(flatten)]
    pub call: CallArgs,

    #[command(flatten)]
    pub scoring: ScoringArgs,

    #[command(flatten)]
    pub report: ReportArgs,
}

/// Splits `provider:model` at the first colon; model ids may contain colons.
pub fn parse_target(raw: &str) -> Result<(Provider, String)> {
    let (provider, model) = raw
        .split_once(':')
        .with_context(|| format!("target `{raw}` must look like <provider>:<model>"))?;
    let provider = Provider::from_str(provider.trim(), true)
        .map_err(|err| anyhow::anyhow!("target `{raw}`: {err}"))?;
    let model = model.trim();
    if model.is_empty() {
        bail!("target `{raw}` has an empty model id");
    }
    Ok((provider, model.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_keeps_colons_in_model_ids() {
        let (provider, model) = parse_target("ollama:qwen2.5vl:7b").expect("valid target");
        assert_eq!(provider, Provider::Ollama);
        assert_eq!(model, "qwen2.5vl:7b");

        let (provider, _) =
            parse_target("openai-compatible:Qwen/Qwen2.5-VL-72B-Instruct").expect("valid target");
        assert_eq!(provider, Provider::OpenaiCompatible);
    }

    #[test]
    fn parse_target_rejects_unknown_providers_and_empty_models() {
        assert!(parse_target("claude:foo").is_err());
        assert!(parse_target("gemini:").is_err());
        assert!(parse_target("gemini").is_err());
    }

    #[test]
    fn cli_parses_score_with_defaults() {
        let cli = Cli::try_parse_from([
            "dealeval",
            "score",
            "--predictions",
            "a.jsonl",
            "--predictions",
            "b.jsonl",
        ])
        .expect("score args should parse");

        let Commands::Score(args) = cli.command else {
            panic!("expected score command");
        };
        assert_eq!(args.predictions.len(), 2);
        assert_eq!(args.report.diag_max_samples, 5);
        let config = args.scoring.to_config().expect("defaults are valid");
        assert_eq!(config, ScoringConfig::default());
    }
}
