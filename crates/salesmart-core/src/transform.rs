//! Downstream SQL refreshes and their dependency graph.
//!
//! Each step is a named, idempotent operation parameterised by the business
//! date. Steps declare their predecessors; the graph groups them into waves
//! where every member of a wave depends only on earlier waves. Members of a
//! wave run concurrently and the whole wave completes before the next starts.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::join_all;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::{error, info};

use crate::db::DbPool;
use crate::error::{PipelineError, Result};
use crate::types::BusinessDate;

/// Placeholder replaced with the quoted ISO business date in SQL scripts.
pub const DATE_PLACEHOLDER: &str = "{{ date }}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationStep {
    pub name: String,
    pub script: String,
    pub predecessors: Vec<String>,
}

impl TransformationStep {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            predecessors: Vec::new(),
        }
    }

    pub fn after(mut self, predecessors: &[&str]) -> Self {
        self.predecessors
            .extend(predecessors.iter().map(|name| name.to_string()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformationParams {
    pub date: BusinessDate,
}

/// Mart refreshes in dependency order.
pub fn default_transformations() -> Vec<TransformationStep> {
    vec![
        TransformationStep::new("update_d_item", "mart.d_item.sql"),
        TransformationStep::new("update_d_customer", "mart.d_customer.sql"),
        TransformationStep::new("update_d_city", "mart.d_city.sql"),
        TransformationStep::new("update_f_sales", "mart.f_sales.sql").after(&[
            "update_d_item",
            "update_d_customer",
            "update_d_city",
        ]),
        TransformationStep::new("update_f_customer_retention", "mart.f_customer_retention.sql")
            .after(&["update_f_sales"]),
    ]
}

#[derive(Debug, Clone)]
pub struct TransformationGraph {
    steps: Vec<TransformationStep>,
    /// Node weights are indices into `steps`; edges point from a
    /// predecessor to its dependent.
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
    waves: Vec<Vec<usize>>,
}

impl TransformationGraph {
    /// Validates names and predecessors and computes execution waves.
    ///
    /// Waves keep registration order among their members.
    pub fn new(steps: Vec<TransformationStep>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(steps.len(), steps.len());
        let mut index_map: HashMap<&str, NodeIndex> = HashMap::with_capacity(steps.len());
        let mut nodes = Vec::with_capacity(steps.len());
        for (idx, step) in steps.iter().enumerate() {
            let node = graph.add_node(idx);
            if index_map.insert(step.name.as_str(), node).is_some() {
                return Err(PipelineError::transformation(&step.name, "registered twice"));
            }
            nodes.push(node);
        }

        for (idx, step) in steps.iter().enumerate() {
            for predecessor in &step.predecessors {
                let &from = index_map.get(predecessor.as_str()).ok_or_else(|| {
                    PipelineError::transformation(
                        &step.name,
                        format!("unknown predecessor '{predecessor}'"),
                    )
                })?;
                graph.update_edge(from, nodes[idx], ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let stuck = &steps[graph[cycle.node_id()]].name;
            return Err(PipelineError::transformation(stuck, "dependency cycle detected"));
        }

        let waves = compute_waves(&graph, &nodes);
        Ok(Self {
            steps,
            graph,
            nodes,
            waves,
        })
    }

    pub fn steps(&self) -> &[TransformationStep] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&TransformationStep> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Direct predecessors of `name`, in registration order.
    pub fn predecessors(&self, name: &str) -> Vec<&TransformationStep> {
        let Some(idx) = self.steps.iter().position(|step| step.name == name) else {
            return Vec::new();
        };
        let mut found: Vec<usize> = self
            .graph
            .neighbors_directed(self.nodes[idx], Direction::Incoming)
            .map(|node| self.graph[node])
            .collect();
        found.sort_unstable();
        found.into_iter().map(|idx| &self.steps[idx]).collect()
    }

    pub fn waves(&self) -> Vec<Vec<&TransformationStep>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|&idx| &self.steps[idx]).collect())
            .collect()
    }

    /// Restricts the graph to `names`, dropping edges to steps left out.
    pub fn subset(&self, names: &[String]) -> Result<Self> {
        for name in names {
            if self.step(name).is_none() {
                return Err(PipelineError::transformation(name, "no such transformation"));
            }
        }
        let keep: HashSet<&str> = names.iter().map(String::as_str).collect();
        let steps = self
            .steps
            .iter()
            .filter(|step| keep.contains(step.name.as_str()))
            .map(|step| TransformationStep {
                name: step.name.clone(),
                script: step.script.clone(),
                predecessors: step
                    .predecessors
                    .iter()
                    .filter(|pred| keep.contains(pred.as_str()))
                    .cloned()
                    .collect(),
            })
            .collect();
        Self::new(steps)
    }
}

/// Groups an acyclic graph into waves by peeling off nodes whose in-degree
/// has dropped to zero.
fn compute_waves(graph: &DiGraph<usize, ()>, nodes: &[NodeIndex]) -> Vec<Vec<usize>> {
    let mut in_degree: HashMap<NodeIndex, usize> = nodes
        .iter()
        .map(|&node| (node, graph.neighbors_directed(node, Direction::Incoming).count()))
        .collect();

    let mut waves = Vec::new();
    let mut current: Vec<NodeIndex> = nodes
        .iter()
        .copied()
        .filter(|node| in_degree[node] == 0)
        .collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &node in &current {
            for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        next.sort_by_key(|node| graph[*node]);
        waves.push(current.iter().map(|node| graph[*node]).collect());
        current = next;
    }
    waves
}

#[async_trait]
pub trait TransformationRunner: Send + Sync {
    /// Runs one named step. Must be safe to repeat for the same date.
    async fn run_transformation(&self, name: &str, params: &TransformationParams) -> Result<()>;
}

/// Runs every wave of `graph`, returning the names of executed steps in
/// completion order of their waves.
///
/// All members of a wave finish before the first failure is reported, and no
/// later wave starts after a failure.
pub async fn run_transformations(
    graph: &TransformationGraph,
    runner: &dyn TransformationRunner,
    params: &TransformationParams,
) -> Result<Vec<String>> {
    let mut executed = Vec::new();
    for wave in graph.waves() {
        let outcomes = join_all(wave.iter().map(|step| async move {
            info!(step = %step.name, date = %params.date, "running transformation");
            let outcome = runner.run_transformation(&step.name, params).await;
            (step.name.as_str(), outcome)
        }))
        .await;

        let mut first_error = None;
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => executed.push(name.to_string()),
                Err(err) => {
                    error!(step = name, error = %err, "transformation failed");
                    if first_error.is_none() {
                        first_error = Some(match err {
                            err @ PipelineError::Transformation { .. } => err,
                            other => PipelineError::transformation(name, other),
                        });
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
    }
    Ok(executed)
}

/// Substitutes the business date into a script template.
pub fn render_script(template: &str, params: &TransformationParams) -> String {
    template.replace(DATE_PLACEHOLDER, &format!("'{}'", params.date.iso()))
}

/// Executes `<sql_dir>/<script>` files against Postgres, one transaction per
/// step.
#[derive(Clone)]
pub struct PostgresTransformationRunner {
    pool: DbPool,
    sql_dir: PathBuf,
    scripts: HashMap<String, String>,
}

impl PostgresTransformationRunner {
    pub fn new(pool: DbPool, sql_dir: impl Into<PathBuf>, graph: &TransformationGraph) -> Self {
        Self {
            pool,
            sql_dir: sql_dir.into(),
            scripts: graph
                .steps()
                .iter()
                .map(|step| (step.name.clone(), step.script.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl TransformationRunner for PostgresTransformationRunner {
    async fn run_transformation(&self, name: &str, params: &TransformationParams) -> Result<()> {
        let script = self
            .scripts
            .get(name)
            .ok_or_else(|| PipelineError::transformation(name, "no such transformation"))?;
        let path = self.sql_dir.join(script);
        let template = tokio::fs::read_to_string(&path).await.map_err(|err| {
            PipelineError::transformation(name, format!("failed to read {}: {err}", path.display()))
        })?;
        let sql = render_script(&template, params);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| PipelineError::transformation(name, err))?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&sql))
            .await
            .map_err(|err| PipelineError::transformation(name, err))?;
        tx.commit()
            .await
            .map_err(|err| PipelineError::transformation(name, err))?;

        info!(step = name, script = %script, date = %params.date, "transformation finished");
        Ok(())
    }
}
