//! Subcommand handlers.

use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use serendip_db::{log_pool_metrics, Database, PoolConfig, ProgressRepository};
use serendip_mining::{
    DistributionEstimator, DistributionSketchBuilder, EstimatorConfig, EvaluationConfig,
    EvaluationService, MiningRunner, RecommendConfig, RecommendRequest, RecommendationEngine,
    RunnerConfig, Stores, WorkBudget,
};

use crate::{Commands, EvalCommand, MineCommand};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(command: Commands, database_url: &str) -> anyhow::Result<()> {
    let db = Database::connect_with_config(database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;
    log_pool_metrics(db.pool());
    let stores = Stores::from_database(&db);

    match command {
        Commands::Migrate => {
            db.migrate().await.context("migration failed")?;
            info!(subsystem = "cli", op = "migrate", "Migrations applied");
            print_json(&json!({ "migrated": true }))
        }
        Commands::Sketch(args) => {
            let builder = DistributionSketchBuilder::new(&stores, WorkBudget::from_env());
            let report = builder.build(&args.into_params()).await?;
            print_json(&report)
        }
        Commands::Estimate { run_id } => {
            print_json(&estimator(&stores).estimate(run_id).await?)
        }
        Commands::Distribution => {
            print_json(&estimator(&stores).current().await?)
        }
        Commands::Mine(command) => mine(&stores, command).await,
        Commands::Progress { run_id } => {
            let run = match run_id {
                Some(id) => stores.progress.get_run(id).await?,
                None => stores.progress.latest_run().await?,
            };
            print_json(&run)
        }
        Commands::Pause { run_id } => {
            let run_id = resolve_active(&stores, run_id).await?;
            print_json(&runner(&stores).pause(run_id).await?)
        }
        Commands::Recommend(args) => {
            let engine = RecommendationEngine::new(&stores, RecommendConfig::from_env());
            let request = RecommendRequest {
                limit: args.limit,
                tiers: args.tiers,
                diversity_weight: args.diversity_weight,
            };
            print_json(&engine.recommend(&request).await?)
        }
        Commands::MarkUsed { pair_id } => {
            let engine = RecommendationEngine::new(&stores, RecommendConfig::from_env());
            engine.mark_used(pair_id).await?;
            print_json(&json!({ "pair_id": pair_id, "used": true }))
        }
        Commands::Eval(command) => eval(&stores, command).await,
        Commands::Purge => {
            let purged = estimator(&stores).purge_expired().await?;
            print_json(&json!({ "purged": purged }))
        }
    }
}

fn estimator(stores: &Stores) -> DistributionEstimator {
    DistributionEstimator::new(stores, WorkBudget::from_env(), EstimatorConfig::from_env())
}

fn runner(stores: &Stores) -> MiningRunner {
    MiningRunner::new(stores, WorkBudget::from_env(), RunnerConfig::from_env())
}

async fn resolve_active(stores: &Stores, run_id: Option<Uuid>) -> anyhow::Result<Uuid> {
    match run_id {
        Some(id) => Ok(id),
        None => stores
            .progress
            .active_run()
            .await?
            .map(|run| run.id)
            .ok_or_else(|| anyhow!("no mining run is in progress")),
    }
}

async fn mine(stores: &Stores, command: MineCommand) -> anyhow::Result<()> {
    let runner = runner(stores);
    let (run_id, max_batches) = match command {
        MineCommand::Start { params, limit } => {
            let run = runner.start(&params.into_params()).await?;
            (run.id, limit.max_batches)
        }
        MineCommand::Resume { run_id, limit } => {
            let run = runner.resume_from(run_id).await?;
            (run.id, limit.max_batches)
        }
        MineCommand::Run { run_id, limit } => {
            (resolve_active(stores, run_id).await?, limit.max_batches)
        }
    };

    let summary = runner.run_until_complete(run_id, max_batches).await?;
    print_json(&summary)
}

async fn eval(stores: &Stores, command: EvalCommand) -> anyhow::Result<()> {
    let service = EvaluationService::new(stores, EvaluationConfig::from_env());
    match command {
        EvalCommand::Claim { limit } => print_json(&service.claim(limit).await?),
        EvalCommand::Complete { pair_id, score } => {
            let tier = service.complete(pair_id, score).await?;
            print_json(&json!({ "pair_id": pair_id, "score": score, "quality_tier": tier }))
        }
        EvalCommand::Fail { pair_id, reason } => {
            let status = service.fail(pair_id, &reason).await?;
            print_json(&json!({ "pair_id": pair_id, "status": status }))
        }
        EvalCommand::ReleaseStale => {
            let released = service.release_stale().await?;
            print_json(&json!({ "released": released }))
        }
        EvalCommand::Pending => {
            let pending = service.pending().await?;
            print_json(&json!({ "pending": pending }))
        }
    }
}
