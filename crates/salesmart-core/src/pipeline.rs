//! End-to-end run for one business date:
//! generate → poll → resolve increment → load → transformation waves.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{HttpReportApi, ReportApi};
use crate::config::PipelineConfig;
use crate::db::DbPool;
use crate::error::PipelineError;
use crate::loader::{load_extract, LoadResult, LoadSettings};
use crate::poller::{poll_report, PollPolicy, Sleeper, TokioSleeper};
use crate::report::{generate_report, resolve_increment};
use crate::sink::{PostgresStagingSink, StagingSink};
use crate::storage::{build_artifact_store, ArtifactStore};
use crate::transform::{
    default_transformations, run_transformations, PostgresTransformationRunner,
    TransformationGraph, TransformationParams, TransformationRunner,
};
use crate::types::{BusinessDate, IdentifierChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GenerateReport,
    PollReport,
    ResolveIncrement,
    LoadExtract,
    Transform,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::GenerateReport => "generate_report",
            Stage::PollReport => "poll_report",
            Stage::ResolveIncrement => "resolve_increment",
            Stage::LoadExtract => "load_extract",
            Stage::Transform => "transform",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run aborted at `stage`; `chain` holds the identifiers obtained so far so
/// an operator can resume from there.
#[derive(Debug, Error)]
#[error("run for {date} failed at {stage} ({chain}): {source}")]
pub struct RunFailure {
    pub date: BusinessDate,
    pub stage: Stage,
    pub chain: IdentifierChain,
    #[source]
    pub source: PipelineError,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReceipt {
    pub run_id: Uuid,
    pub business_date: BusinessDate,
    pub chain: IdentifierChain,
    pub load: LoadResult,
    pub transformations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_transformations: bool,
}

/// Per-run state threaded explicitly between steps.
#[derive(Debug)]
struct RunContext {
    run_id: Uuid,
    date: BusinessDate,
    chain: IdentifierChain,
}

impl RunContext {
    fn new(date: BusinessDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            date,
            chain: IdentifierChain::default(),
        }
    }

    fn fail(&self, stage: Stage, source: PipelineError) -> RunFailure {
        error!(
            run_id = %self.run_id,
            date = %self.date,
            stage = %stage,
            chain = %self.chain,
            error = %source,
            "pipeline run failed"
        );
        RunFailure {
            date: self.date,
            stage,
            chain: self.chain.clone(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub poll: PollPolicy,
    pub extract_filename: String,
    pub load: LoadSettings,
}

impl RunSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            poll: config.poll,
            extract_filename: config.extract_filename.clone(),
            load: LoadSettings::from_config(config),
        }
    }
}

/// Collaborators a pipeline talks to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub api: Arc<dyn ReportApi>,
    pub store: Arc<dyn ArtifactStore>,
    pub sink: Arc<dyn StagingSink>,
    pub transformations: Arc<dyn TransformationRunner>,
    pub sleeper: Arc<dyn Sleeper>,
}

pub struct SalesMartPipeline {
    deps: PipelineDeps,
    graph: TransformationGraph,
    settings: RunSettings,
}

impl SalesMartPipeline {
    pub fn new(deps: PipelineDeps, graph: TransformationGraph, settings: RunSettings) -> Self {
        Self {
            deps,
            graph,
            settings,
        }
    }

    /// Production wiring: HTTP report service, configured artifact store,
    /// Postgres staging sink and SQL runner.
    pub async fn from_config(config: &PipelineConfig, pool: DbPool) -> Result<Self, PipelineError> {
        let graph = TransformationGraph::new(default_transformations())?;
        let deps = PipelineDeps {
            api: Arc::new(HttpReportApi::new(&config.api)?),
            store: build_artifact_store(config).await?,
            sink: Arc::new(PostgresStagingSink::new(pool.clone())),
            transformations: Arc::new(PostgresTransformationRunner::new(
                pool,
                config.sql_dir.clone(),
                &graph,
            )),
            sleeper: Arc::new(TokioSleeper),
        };
        Ok(Self::new(deps, graph, RunSettings::from_config(config)))
    }

    pub fn graph(&self) -> &TransformationGraph {
        &self.graph
    }

    pub async fn run(&self, date: BusinessDate, options: RunOptions) -> Result<RunReceipt, RunFailure> {
        let mut ctx = RunContext::new(date);
        info!(run_id = %ctx.run_id, date = %date, "pipeline run started");

        let job = generate_report(self.deps.api.as_ref())
            .await
            .map_err(|err| ctx.fail(Stage::GenerateReport, err))?;
        ctx.chain.task_id = Some(job.clone());

        let report = poll_report(
            self.deps.api.as_ref(),
            &job,
            self.settings.poll,
            self.deps.sleeper.as_ref(),
        )
        .await
        .map_err(|err| ctx.fail(Stage::PollReport, err))?;
        ctx.chain.report_id = Some(report.clone());

        let increment = resolve_increment(self.deps.api.as_ref(), &report, date)
            .await
            .map_err(|err| ctx.fail(Stage::ResolveIncrement, err))?;
        ctx.chain.increment_id = Some(increment.clone());

        let load = load_extract(
            self.deps.store.as_ref(),
            self.deps.sink.as_ref(),
            &self.settings.load,
            &increment,
            &self.settings.extract_filename,
            date,
        )
        .await
        .map_err(|err| ctx.fail(Stage::LoadExtract, err))?;

        let transformations = if options.skip_transformations {
            warn!(run_id = %ctx.run_id, "skipping transformations");
            Vec::new()
        } else {
            run_transformations(
                &self.graph,
                self.deps.transformations.as_ref(),
                &TransformationParams { date },
            )
            .await
            .map_err(|err| ctx.fail(Stage::Transform, err))?
        };

        info!(run_id = %ctx.run_id, date = %date, chain = %ctx.chain, "pipeline run finished");
        Ok(RunReceipt {
            run_id: ctx.run_id,
            business_date: date,
            chain: ctx.chain,
            load,
            transformations,
        })
    }

    /// Runs `dates` one after another, oldest first, stopping at the first
    /// failure.
    pub async fn backfill(
        &self,
        dates: &[BusinessDate],
        options: RunOptions,
    ) -> Result<Vec<RunReceipt>, RunFailure> {
        let mut ordered = dates.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut receipts = Vec::with_capacity(ordered.len());
        for date in ordered {
            receipts.push(self.run(date, options).await?);
        }
        Ok(receipts)
    }

    /// Re-runs transformations only. An empty `steps` selects the full graph.
    pub async fn transform(
        &self,
        date: BusinessDate,
        steps: &[String],
    ) -> Result<Vec<String>, RunFailure> {
        let ctx = RunContext::new(date);
        let graph = if steps.is_empty() {
            self.graph.clone()
        } else {
            self.graph
                .subset(steps)
                .map_err(|err| ctx.fail(Stage::Transform, err))?
        };
        run_transformations(
            &graph,
            self.deps.transformations.as_ref(),
            &TransformationParams { date },
        )
        .await
        .map_err(|err| ctx.fail(Stage::Transform, err))
    }
}
