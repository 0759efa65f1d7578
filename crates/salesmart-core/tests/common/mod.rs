#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use salesmart_core::{
    api::{
        GenerateReportResponse, IncrementData, IncrementResponse, ReportApi, ReportData,
        ReportStatusResponse,
    },
    config::StagingTarget,
    error::{PipelineError, Result},
    extract::StagingRow,
    loader::LoadSettings,
    pipeline::{PipelineDeps, RunSettings, SalesMartPipeline},
    poller::{PollPolicy, Sleeper},
    sink::StagingSink,
    storage::ArtifactStore,
    transform::{default_transformations, TransformationGraph, TransformationParams, TransformationRunner},
    types::{BusinessDate, IncrementHandle, JobHandle, ReportHandle},
};

pub const HEADER: &str = "uniq_id,date_time,city_id,city_name,customer_id,first_name,last_name,item_id,item_name,quantity,payment_amount";

/// Five rows, `o2` repeated, no status column.
pub fn five_row_extract() -> String {
    format!(
        ",id,{HEADER}\n\
         0,1,o1,2023-05-01 08:00:00,1,Moscow,10,Ann,Lee,100,Tea,2,50.0\n\
         1,2,o2,2023-05-01 09:00:00,2,Kazan,11,Bob,Ray,101,Milk,1,20.5\n\
         2,3,o3,2023-05-01 10:00:00,1,Moscow,12,Cid,Fox,102,Rice,3,9.9\n\
         3,4,o2,2023-05-01 11:00:00,3,Omsk,11,Bob,Ray,101,Milk,7,70.0\n\
         4,5,o4,2023-05-01 12:00:00,2,Kazan,13,Dee,Roe,100,Tea,1,25.0\n"
    )
}

pub fn date(value: &str) -> BusinessDate {
    value.parse().expect("valid date")
}

pub fn status(value: &str) -> Result<ReportStatusResponse> {
    Ok(ReportStatusResponse {
        status: value.to_string(),
        data: None,
    })
}

pub fn success(report_id: &str) -> Result<ReportStatusResponse> {
    Ok(ReportStatusResponse {
        status: "SUCCESS".to_string(),
        data: Some(ReportData {
            report_id: Some(report_id.to_string()),
        }),
    })
}

pub fn increment(increment_id: Option<&str>) -> Result<IncrementResponse> {
    Ok(IncrementResponse {
        data: Some(IncrementData {
            increment_id: increment_id.map(str::to_string),
        }),
    })
}

pub fn transport_failure(endpoint: &str) -> PipelineError {
    PipelineError::UpstreamRequest {
        endpoint: endpoint.to_string(),
        message: "connection reset".to_string(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApiCalls {
    pub generate: usize,
    pub status: usize,
    pub increment: usize,
}

/// Report service replaying scripted responses. Exhausted status scripts keep
/// answering `PENDING`.
#[derive(Default)]
pub struct FakeReportApi {
    task_ids: Mutex<VecDeque<String>>,
    statuses: Mutex<VecDeque<Result<ReportStatusResponse>>>,
    increments: Mutex<HashMap<BusinessDate, Result<IncrementResponse>>>,
    calls: Mutex<ApiCalls>,
    increment_requests: Mutex<Vec<(String, BusinessDate)>>,
}

impl FakeReportApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(self, task_id: &str) -> Self {
        self.task_ids
            .lock()
            .unwrap()
            .push_back(task_id.to_string());
        self
    }

    pub fn with_status(self, response: Result<ReportStatusResponse>) -> Self {
        self.statuses.lock().unwrap().push_back(response);
        self
    }

    pub fn with_increment(self, date: BusinessDate, response: Result<IncrementResponse>) -> Self {
        self.increments.lock().unwrap().insert(date, response);
        self
    }

    pub fn calls(&self) -> ApiCalls {
        *self.calls.lock().unwrap()
    }

    pub fn increment_requests(&self) -> Vec<(String, BusinessDate)> {
        self.increment_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportApi for FakeReportApi {
    async fn generate_report(&self) -> Result<GenerateReportResponse> {
        self.calls.lock().unwrap().generate += 1;
        Ok(GenerateReportResponse {
            task_id: self.task_ids.lock().unwrap().pop_front(),
        })
    }

    async fn get_report(&self, _task: &JobHandle) -> Result<ReportStatusResponse> {
        self.calls.lock().unwrap().status += 1;
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| status("PENDING"))
    }

    async fn get_increment(
        &self,
        report: &ReportHandle,
        date: BusinessDate,
    ) -> Result<IncrementResponse> {
        self.calls.lock().unwrap().increment += 1;
        self.increment_requests
            .lock()
            .unwrap()
            .push((report.to_string(), date));
        match self.increments.lock().unwrap().remove(&date) {
            Some(response) => response,
            None => Ok(IncrementResponse::default()),
        }
    }
}

/// Artifact store backed by an in-memory map of increment id to file body.
#[derive(Default)]
pub struct FakeArtifactStore {
    files: Mutex<HashMap<String, Bytes>>,
    fetches: Mutex<Vec<String>>,
}

impl FakeArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, increment: &str, body: impl Into<String>) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(increment.to_string(), Bytes::from(body.into()));
        self
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for FakeArtifactStore {
    fn location(&self, increment: &IncrementHandle, filename: &str) -> String {
        format!("memory://{increment}/{filename}")
    }

    async fn fetch(&self, increment: &IncrementHandle, filename: &str) -> Result<Bytes> {
        self.fetches.lock().unwrap().push(increment.to_string());
        self.files
            .lock()
            .unwrap()
            .get(increment.as_str())
            .cloned()
            .ok_or_else(|| PipelineError::Download {
                url: self.location(increment, filename),
                message: "HTTP 404 Not Found".to_string(),
            })
    }
}

/// Staging table kept in memory with `uniq_id` upsert semantics.
#[derive(Default)]
pub struct MemoryStagingSink {
    rows: Mutex<HashMap<String, StagingRow>>,
    loads: Mutex<usize>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryStagingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        let sink = Self::default();
        *sink.fail_with.lock().unwrap() = Some(message.to_string());
        sink
    }

    pub fn rows(&self) -> Vec<StagingRow> {
        let mut rows: Vec<StagingRow> = self.rows.lock().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| a.uniq_id.cmp(&b.uniq_id));
        rows
    }

    pub fn row(&self, uniq_id: &str) -> Option<StagingRow> {
        self.rows.lock().unwrap().get(uniq_id).cloned()
    }

    pub fn loads(&self) -> usize {
        *self.loads.lock().unwrap()
    }
}

#[async_trait]
impl StagingSink for MemoryStagingSink {
    async fn upsert_file(&self, _target: &StagingTarget, path: &Path) -> Result<u64> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(PipelineError::Load(message));
        }

        let mut reader = csv::Reader::from_path(path)
            .map_err(|err| PipelineError::Load(err.to_string()))?;
        let parsed = reader
            .deserialize::<StagingRow>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| PipelineError::Load(err.to_string()))?;

        let mut keys = HashSet::new();
        for row in &parsed {
            if !keys.insert(row.uniq_id.clone()) {
                return Err(PipelineError::Load(format!(
                    "duplicate key {} within one load",
                    row.uniq_id
                )));
            }
        }

        let mut rows = self.rows.lock().unwrap();
        for row in &parsed {
            rows.insert(row.uniq_id.clone(), row.clone());
        }
        *self.loads.lock().unwrap() += 1;
        Ok(parsed.len() as u64)
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(String),
    Finished(String),
}

/// Transformation runner that records start/finish events. Each step yields
/// once between the two so concurrently scheduled steps interleave.
#[derive(Default)]
pub struct RecordingRunner {
    events: Mutex<Vec<Event>>,
    failing: Mutex<HashSet<String>>,
    dates: Mutex<Vec<BusinessDate>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(self, name: &str) -> Self {
        self.failing.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Finished(name) => Some(name),
                Event::Started(_) => None,
            })
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Started(name) => Some(name),
                Event::Finished(_) => None,
            })
            .collect()
    }

    pub fn dates(&self) -> Vec<BusinessDate> {
        self.dates.lock().unwrap().clone()
    }

    pub fn position(&self, event: &Event) -> usize {
        self.events()
            .iter()
            .position(|candidate| candidate == event)
            .unwrap_or_else(|| panic!("event {event:?} not recorded"))
    }
}

#[async_trait]
impl TransformationRunner for RecordingRunner {
    async fn run_transformation(&self, name: &str, params: &TransformationParams) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Started(name.to_string()));
        self.dates.lock().unwrap().push(params.date);
        tokio::task::yield_now().await;

        if self.failing.lock().unwrap().contains(name) {
            return Err(PipelineError::Transformation {
                name: name.to_string(),
                message: "relation does not exist".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push(Event::Finished(name.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub api: Arc<FakeReportApi>,
    pub store: Arc<FakeArtifactStore>,
    pub sink: Arc<MemoryStagingSink>,
    pub runner: Arc<RecordingRunner>,
    pub sleeper: Arc<RecordingSleeper>,
    pub work_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(api: FakeReportApi, store: FakeArtifactStore) -> Self {
        Self::with_parts(api, store, MemoryStagingSink::new(), RecordingRunner::new())
    }

    pub fn with_parts(
        api: FakeReportApi,
        store: FakeArtifactStore,
        sink: MemoryStagingSink,
        runner: RecordingRunner,
    ) -> Self {
        Self {
            api: Arc::new(api),
            store: Arc::new(store),
            sink: Arc::new(sink),
            runner: Arc::new(runner),
            sleeper: Arc::new(RecordingSleeper::default()),
            work_dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            work_dir: self.work_dir.path().to_path_buf(),
            default_status: "shipped".to_string(),
            target: StagingTarget::default(),
        }
    }

    pub fn pipeline(&self) -> SalesMartPipeline {
        let deps = PipelineDeps {
            api: self.api.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            transformations: self.runner.clone(),
            sleeper: self.sleeper.clone(),
        };
        let settings = RunSettings {
            poll: PollPolicy::default(),
            extract_filename: "user_order_log_inc.csv".to_string(),
            load: self.load_settings(),
        };
        let graph = TransformationGraph::new(default_transformations()).expect("default graph");
        SalesMartPipeline::new(deps, graph, settings)
    }
}
