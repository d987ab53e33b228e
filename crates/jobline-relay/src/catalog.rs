//! Job catalog collaborator.
//!
//! The relay only needs two calls from the catalog: a keyword search and a
//! single-job lookup. [`CareersCatalog`] talks to the careers search API over
//! `reqwest`; tests substitute their own [`JobCatalog`].

use std::time::Duration;

use async_trait::async_trait;
use jobline_settings::CatalogSettings;
use serde_json::Value;

use crate::errors::CatalogError;

/// One page of search results.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchPage {
    pub jobs: Vec<Value>,
    pub total: u64,
    /// The catalog's full response, handed to the model as tool output.
    pub raw: Value,
}

#[async_trait]
pub trait JobCatalog: Send + Sync {
    async fn search(&self, query: &str, country: Option<&str>) -> Result<SearchPage, CatalogError>;
    async fn job_details(&self, job_id: &str) -> Result<Value, CatalogError>;
}

/// HTTP adapter for the careers search API.
pub struct CareersCatalog {
    client: reqwest::Client,
    base_url: String,
    language: String,
    page_size: u32,
}

impl CareersCatalog {
    pub fn new(settings: &CatalogSettings) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("jobline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            language: settings.language.clone(),
            page_size: settings.page_size,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, CatalogError> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl JobCatalog for CareersCatalog {
    async fn search(&self, query: &str, country: Option<&str>) -> Result<SearchPage, CatalogError> {
        let mut params = vec![
            ("q", query.to_owned()),
            ("l", self.language.clone()),
            ("pg", "1".to_owned()),
            ("pgSz", self.page_size.to_string()),
            ("o", "Relevance".to_owned()),
            ("flt", "true".to_owned()),
        ];
        if let Some(country) = country.filter(|c| !c.trim().is_empty()) {
            params.push(("lc", country.to_owned()));
        }
        let raw = self
            .get_json(&format!("{}/search", self.base_url), &params)
            .await?;
        let result = &raw["operationResult"]["result"];
        let jobs = result
            .get("jobs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = result.get("totalJobs").and_then(Value::as_u64).unwrap_or(0);
        tracing::debug!(query, ?country, returned = jobs.len(), total, "catalog search");
        Ok(SearchPage { jobs, total, raw })
    }

    async fn job_details(&self, job_id: &str) -> Result<Value, CatalogError> {
        let raw = self
            .get_json(&format!("{}/job/{job_id}", self.base_url), &[])
            .await?;
        match raw.pointer("/operationResult/result") {
            Some(job) if job.is_object() => Ok(job.clone()),
            _ => Err(CatalogError::Decode(format!("no job record for {job_id}"))),
        }
    }
}
