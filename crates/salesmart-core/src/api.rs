//! Client for the report service.
//!
//! The service exposes three endpoints: one starts a report job, one reports
//! job status, one resolves a dated increment inside a finished report. The
//! [`ReportApi`] trait is the seam the acquisition steps are written against;
//! [`HttpReportApi`] is the production implementation.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::{PipelineError, Result};
use crate::types::{BusinessDate, JobHandle, ReportHandle};

pub const GENERATE_REPORT: &str = "/generate_report";
pub const GET_REPORT: &str = "/get_report";
pub const GET_INCREMENT: &str = "/get_increment";

/// Status value that marks a finished report job.
pub const STATUS_SUCCESS: &str = "SUCCESS";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct GenerateReportResponse {
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ReportStatusResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: Option<ReportData>,
}

impl ReportStatusResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ReportData {
    #[serde(default)]
    pub report_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct IncrementResponse {
    #[serde(default)]
    pub data: Option<IncrementData>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct IncrementData {
    #[serde(default)]
    pub increment_id: Option<String>,
}

#[async_trait]
pub trait ReportApi: Send + Sync {
    async fn generate_report(&self) -> Result<GenerateReportResponse>;

    async fn get_report(&self, task: &JobHandle) -> Result<ReportStatusResponse>;

    async fn get_increment(
        &self,
        report: &ReportHandle,
        date: BusinessDate,
    ) -> Result<IncrementResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpReportApi {
    client: Client,
    base_url: String,
}

impl HttpReportApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-nickname"),
            header_value("X-Nickname", &config.nickname)?,
        );
        headers.insert(
            HeaderName::from_static("x-cohort"),
            header_value("X-Cohort", &config.cohort)?,
        );
        headers.insert(
            HeaderName::from_static("x-project"),
            HeaderValue::from_static(if config.project { "True" } else { "False" }),
        );
        let mut api_key = header_value("X-API-KEY", &config.api_key)?;
        api_key.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-api-key"), api_key);
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| PipelineError::Config(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|err| PipelineError::upstream(endpoint, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| PipelineError::upstream(endpoint, err))?;
        debug!(endpoint, %status, body = %body, "report service response");

        if !status.is_success() {
            return Err(PipelineError::upstream(
                endpoint,
                format!("HTTP {status}: {body}"),
            ));
        }

        serde_json::from_str(&body).map_err(|err| {
            PipelineError::upstream(endpoint, format!("unexpected body {body:?}: {err}"))
        })
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| PipelineError::Config(format!("invalid value for header {name}: {err}")))
}

#[async_trait]
impl ReportApi for HttpReportApi {
    async fn generate_report(&self) -> Result<GenerateReportResponse> {
        let request = self.client.post(self.url(GENERATE_REPORT));
        self.send_json(GENERATE_REPORT, request).await
    }

    async fn get_report(&self, task: &JobHandle) -> Result<ReportStatusResponse> {
        let request = self
            .client
            .get(self.url(GET_REPORT))
            .query(&[("task_id", task.as_str())]);
        self.send_json(GET_REPORT, request).await
    }

    async fn get_increment(
        &self,
        report: &ReportHandle,
        date: BusinessDate,
    ) -> Result<IncrementResponse> {
        let midnight = date.midnight();
        let request = self
            .client
            .get(self.url(GET_INCREMENT))
            .query(&[("report_id", report.as_str()), ("date", midnight.as_str())]);
        self.send_json(GET_INCREMENT, request).await
    }
}
