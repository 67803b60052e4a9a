//! serendip: command-line orchestrator for weak-tie candidate mining.
//!
//! Every subcommand is one unit of work against the database named by
//! `DATABASE_URL`; results are printed as JSON on stdout and logs go to
//! stderr (or `LOG_FILE`).

mod commands;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use serendip_core::{BandSource, MiningParams, QualityTier, SketchParams};

#[derive(Parser)]
#[command(name = "serendip")]
#[command(author, version, about = "Weak-tie candidate mining over a claim embedding corpus")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Database URL (default: $DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Sample pair similarities into a new sketch run
    Sketch(SketchArgs),

    /// Summarise a sketch run into the distribution snapshot
    Estimate {
        /// Sketch run to summarise (default: most recent)
        #[arg(long)]
        run_id: Option<Uuid>,
    },

    /// Show the current distribution snapshot
    Distribution,

    /// Candidate mining runs
    #[command(subcommand)]
    Mine(MineCommand),

    /// Show a mining run (default: the most recent)
    Progress {
        run_id: Option<Uuid>,
    },

    /// Pause a mining run (default: the active one)
    Pause {
        run_id: Option<Uuid>,
    },

    /// Rank evaluated, unused candidate pairs
    Recommend(RecommendArgs),

    /// Flag a candidate pair as consumed
    MarkUsed {
        pair_id: Uuid,
    },

    /// Evaluation queue maintenance
    #[command(subcommand)]
    Eval(EvalCommand),

    /// Delete similarity observations past the retention window
    Purge,
}

#[derive(Subcommand)]
pub enum MineCommand {
    /// Start a new run and mine batches
    Start {
        #[command(flatten)]
        params: MineParamArgs,

        #[command(flatten)]
        limit: BatchLimit,
    },

    /// Continue a paused or failed run in a new run
    Resume {
        run_id: Uuid,

        #[command(flatten)]
        limit: BatchLimit,
    },

    /// Keep mining the active run
    Run {
        /// Run to continue (default: the active one)
        #[arg(long)]
        run_id: Option<Uuid>,

        #[command(flatten)]
        limit: BatchLimit,
    },
}

#[derive(Args)]
pub struct BatchLimit {
    /// Stop after this many batches (default: until the corpus is exhausted)
    #[arg(long)]
    pub max_batches: Option<usize>,
}

#[derive(Args)]
pub struct SketchArgs {
    #[arg(long)]
    pub seed: Option<i64>,

    /// Source claims per round
    #[arg(long)]
    pub source_sample: Option<i64>,

    /// Destination claims per round
    #[arg(long)]
    pub dest_sample: Option<i64>,

    #[arg(long)]
    pub rounds: Option<i32>,

    /// Also observe pairs whose claims share a document
    #[arg(long)]
    pub include_same_document: bool,
}

impl SketchArgs {
    pub fn into_params(self) -> SketchParams {
        let mut params = SketchParams::from_env();
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        if let Some(n) = self.source_sample {
            params.source_sample = n;
        }
        if let Some(n) = self.dest_sample {
            params.dest_sample = n;
        }
        if let Some(n) = self.rounds {
            params.rounds = n;
        }
        if self.include_same_document {
            params.exclude_same_document = false;
        }
        params
    }
}

#[derive(Args)]
pub struct MineParamArgs {
    /// Source claims per batch
    #[arg(long)]
    pub source_batch: Option<i64>,

    /// Destination claims sampled per round
    #[arg(long)]
    pub dest_sample: Option<i64>,

    /// Candidates kept per source
    #[arg(long, short = 'k')]
    pub per_source: Option<i64>,

    /// Lower band percentile as a fraction
    #[arg(long)]
    pub band_low: Option<f64>,

    /// Upper band percentile as a fraction
    #[arg(long)]
    pub band_high: Option<f64>,

    #[arg(long)]
    pub seed: Option<i64>,

    /// Rounds per batch
    #[arg(long)]
    pub max_rounds: Option<i32>,

    /// Fraction of the batch quota that ends the round loop
    #[arg(long)]
    pub early_stop_ratio: Option<f64>,

    /// Band source: local or global
    #[arg(long)]
    pub band_source: Option<BandSource>,
}

impl MineParamArgs {
    pub fn into_params(self) -> MiningParams {
        let mut params = MiningParams::from_env();
        if let Some(v) = self.source_batch {
            params.source_batch_size = v;
        }
        if let Some(v) = self.dest_sample {
            params.dest_sample_size = v;
        }
        if let Some(v) = self.per_source {
            params.per_source_quota = v;
        }
        if let Some(v) = self.band_low {
            params.band_low = v;
        }
        if let Some(v) = self.band_high {
            params.band_high = v;
        }
        if let Some(v) = self.seed {
            params.seed = v;
        }
        if let Some(v) = self.max_rounds {
            params.max_rounds = v;
        }
        if let Some(v) = self.early_stop_ratio {
            params.early_stop_ratio = v;
        }
        if let Some(v) = self.band_source {
            params.band_source = v;
        }
        params
    }
}

#[derive(Args)]
pub struct RecommendArgs {
    #[arg(long)]
    pub limit: Option<usize>,

    /// Acceptable tiers in priority order, e.g. excellent,premium
    #[arg(long, value_delimiter = ',')]
    pub tiers: Option<Vec<QualityTier>>,

    /// Weight of the diversity signal in [0, 1]
    #[arg(long, short = 'w')]
    pub diversity_weight: Option<f64>,
}

#[derive(Subcommand)]
pub enum EvalCommand {
    /// Claim pending pairs for scoring
    Claim {
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Record a score in [0, 100]
    Complete {
        pair_id: Uuid,
        score: f64,
    },

    /// Record a failed scoring attempt
    Fail {
        pair_id: Uuid,

        #[arg(long, default_value = "evaluation failed")]
        reason: String,
    },

    /// Return abandoned claims to the queue
    ReleaseStale,

    /// Count pairs awaiting evaluation
    Pending,
}

/// Initialise tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors
///   RUST_LOG    - standard env filter (default: "serendip=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "serendip=info,serendip_mining=info,serendip_db=info,serendip_cli=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("serendip.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "postgres://localhost/serendip".to_string());

    commands::run(cli.command, &database_url).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mine_flags_override_params() {
        let cli = Cli::try_parse_from([
            "serendip",
            "mine",
            "start",
            "--source-batch",
            "10",
            "-k",
            "5",
            "--band-source",
            "global",
            "--max-batches",
            "2",
        ])
        .unwrap();
        let Commands::Mine(MineCommand::Start { params, limit }) = cli.command else {
            panic!("expected mine start");
        };
        let params = params.into_params();
        assert_eq!(params.source_batch_size, 10);
        assert_eq!(params.per_source_quota, 5);
        assert_eq!(params.band_source, BandSource::Global);
        assert_eq!(limit.max_batches, Some(2));
    }

    #[test]
    fn test_recommend_tiers_parse_in_order() {
        let cli = Cli::try_parse_from([
            "serendip",
            "recommend",
            "--tiers",
            "premium,excellent",
            "-w",
            "0.5",
        ])
        .unwrap();
        let Commands::Recommend(args) = cli.command else {
            panic!("expected recommend");
        };
        assert_eq!(
            args.tiers,
            Some(vec![QualityTier::Premium, QualityTier::Excellent])
        );
        assert_eq!(args.diversity_weight, Some(0.5));
    }
}
