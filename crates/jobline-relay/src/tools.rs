//! Assistant tools and their dispatch.
//!
//! A tool call yields text for the model and, when it succeeded, the session
//! mutation it implies. Tools never write session state themselves; the
//! caller routes the mutation through the store's single mutation entry.

use std::time::Instant;

use jobline_core::{Mutation, Session};
use jobline_telemetry::metrics::{TOOL_CALLS_TOTAL, TOOL_CALL_DURATION_SECONDS};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::catalog::JobCatalog;

pub const SEARCH_JOBS: &str = "search_jobs";
pub const DISPLAY_JOB_DETAILS: &str = "display_job_details";

/// Below this normalized Levenshtein similarity a title does not match.
pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.3;

/// Banner shown while a tool runs.
pub const TOOL_STATUS_SECS: u64 = 8;

/// Function schemas advertised in `session.update`.
pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "name": SEARCH_JOBS,
            "description": "Search for jobs at Microsoft",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The job search query (e.g., job title, skills, etc.)"
                    },
                    "country": {
                        "type": "string",
                        "description": "Optional country to filter jobs by"
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }
        }),
        json!({
            "type": "function",
            "name": DISPLAY_JOB_DETAILS,
            "description": "Display details for a specific job by its title. Will match the closest title from current search results.",
            "parameters": {
                "type": "object",
                "properties": {
                    "title": {
                        "type": "string",
                        "description": "The title or partial title of the job to display"
                    }
                },
                "required": ["title"],
                "additionalProperties": false
            }
        }),
    ]
}

/// Banner text while `tool` runs, if it has one.
pub fn status_text(tool: &str) -> Option<&'static str> {
    match tool {
        SEARCH_JOBS => Some("Searching for jobs…"),
        DISPLAY_JOB_DETAILS => Some("Loading job details…"),
        _ => None,
    }
}

/// What a tool call produced.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    /// Text returned to the model as `function_call_output`.
    pub output: String,
    pub mutation: Option<Mutation>,
}

impl ToolOutcome {
    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self {
            output: json!({ "error": message.into() }).to_string(),
            mutation: None,
        }
    }
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Deserialize)]
struct DisplayArgs {
    title: String,
}

/// Run tool `name` with JSON `arguments` against the session as last read.
pub async fn run_tool(
    catalog: &dyn JobCatalog,
    name: &str,
    arguments: &str,
    session: &Session,
) -> ToolOutcome {
    let started = Instant::now();
    let outcome = match name {
        SEARCH_JOBS => match serde_json::from_str::<SearchArgs>(arguments) {
            Ok(args) => search_jobs(catalog, args).await,
            Err(e) => ToolOutcome::error(format!("invalid arguments: {e}")),
        },
        DISPLAY_JOB_DETAILS => match serde_json::from_str::<DisplayArgs>(arguments) {
            Ok(args) => display_job(catalog, &args.title, session).await,
            Err(e) => ToolOutcome::error(format!("invalid arguments: {e}")),
        },
        other => {
            tracing::warn!(tool = other, "call for unknown tool");
            ToolOutcome::error(format!("Unknown tool: {other}"))
        }
    };
    let tool = match name {
        SEARCH_JOBS => SEARCH_JOBS,
        DISPLAY_JOB_DETAILS => DISPLAY_JOB_DETAILS,
        _ => "unknown",
    };
    let result = if outcome.mutation.is_some() { "ok" } else { "error" };
    metrics::counter!(TOOL_CALLS_TOTAL, "tool" => tool, "result" => result).increment(1);
    metrics::histogram!(TOOL_CALL_DURATION_SECONDS, "tool" => tool)
        .record(started.elapsed().as_secs_f64());
    outcome
}

async fn search_jobs(catalog: &dyn JobCatalog, args: SearchArgs) -> ToolOutcome {
    let country = args.country.filter(|c| !c.trim().is_empty());
    match catalog.search(&args.query, country.as_deref()).await {
        Ok(page) => ToolOutcome {
            output: page.raw.to_string(),
            mutation: Some(Mutation::SearchCompleted {
                query: args.query,
                country,
                results: page.jobs,
                total_count: page.total,
            }),
        },
        Err(e) => {
            tracing::warn!(error = %e, "job search failed");
            ToolOutcome::error(format!("API request failed: {e}"))
        }
    }
}

async fn display_job(catalog: &dyn JobCatalog, title: &str, session: &Session) -> ToolOutcome {
    let results = session
        .search_state
        .as_ref()
        .map(|s| s.results.as_slice())
        .unwrap_or_default();
    if results.is_empty() {
        return ToolOutcome::error("No active search results. Please search for jobs first.");
    }
    let Some(job_id) = best_title_match(results, title).and_then(job_id) else {
        return ToolOutcome::error(format!("No matching job found for title: {title}"));
    };
    match catalog.job_details(&job_id).await {
        Ok(job) => ToolOutcome {
            output: job.to_string(),
            mutation: Some(Mutation::JobSelected { job }),
        },
        Err(e) => {
            tracing::warn!(job_id, error = %e, "job lookup failed");
            ToolOutcome::error(format!("API request failed: {e}"))
        }
    }
}

/// Identifier of a catalog job record.
pub fn job_id(job: &Value) -> Option<String> {
    ["jobId", "id"].iter().find_map(|key| match job.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// The result whose title best matches `title`.
///
/// A case-insensitive substring match wins outright; otherwise the highest
/// normalized Levenshtein similarity at or above the threshold.
pub fn best_title_match<'a>(results: &'a [Value], title: &str) -> Option<&'a Value> {
    let wanted = title.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    let titled = results.iter().filter_map(|job| {
        let t = job.get("title")?.as_str()?.to_lowercase();
        Some((job, t))
    });

    let mut best: Option<(&Value, f64)> = None;
    for (job, candidate) in titled {
        if candidate.contains(&wanted) {
            return Some(job);
        }
        let score = strsim::normalized_levenshtein(&wanted, &candidate);
        if score >= TITLE_SIMILARITY_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
            best = Some((job, score));
        }
    }
    best.map(|(job, _)| job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SearchPage;
    use crate::errors::CatalogError;
    use async_trait::async_trait;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use jobline_core::SessionId;

    struct FakeCatalog;

    #[async_trait]
    impl JobCatalog for FakeCatalog {
        async fn search(&self, query: &str, _country: Option<&str>) -> Result<SearchPage, CatalogError> {
            if query == "fail" {
                return Err(CatalogError::Status(500));
            }
            let jobs = vec![
                json!({"jobId": "1", "title": "Senior Software Engineer"}),
                json!({"jobId": "2", "title": "Product Designer"}),
            ];
            Ok(SearchPage {
                raw: json!({"operationResult": {"result": {"jobs": jobs.clone(), "totalJobs": 2}}}),
                jobs,
                total: 2,
            })
        }

        async fn job_details(&self, job_id: &str) -> Result<Value, CatalogError> {
            Ok(json!({"jobId": job_id, "title": "detail"}))
        }
    }

    fn session_with_results() -> Session {
        let mut s = Session::new(SessionId::from_raw("sess_t"), Utc::now());
        let _ = Mutation::SearchCompleted {
            query: "q".into(),
            country: None,
            results: vec![
                json!({"jobId": "1", "title": "Senior Software Engineer"}),
                json!({"jobId": "2", "title": "Product Designer"}),
                json!({"jobId": 3, "title": "Data Scientist"}),
            ],
            total_count: 3,
        }
        .apply(&mut s, Utc::now());
        s
    }

    #[tokio::test]
    async fn search_yields_mutation() {
        let s = Session::new(SessionId::from_raw("sess_t"), Utc::now());
        let out = run_tool(&FakeCatalog, SEARCH_JOBS, r#"{"query":"engineer","country":""}"#, &s).await;
        assert_matches!(
            out.mutation,
            Some(Mutation::SearchCompleted { ref query, country: None, total_count: 2, .. }) if query == "engineer"
        );
        assert!(out.output.contains("operationResult"));
    }

    #[tokio::test]
    async fn search_failure_is_error_output() {
        let s = Session::new(SessionId::from_raw("sess_t"), Utc::now());
        let out = run_tool(&FakeCatalog, SEARCH_JOBS, r#"{"query":"fail"}"#, &s).await;
        assert!(out.mutation.is_none());
        let v: Value = serde_json::from_str(&out.output).unwrap();
        assert!(v["error"].as_str().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn display_without_results_is_error() {
        let s = Session::new(SessionId::from_raw("sess_t"), Utc::now());
        let out = run_tool(&FakeCatalog, DISPLAY_JOB_DETAILS, r#"{"title":"anything"}"#, &s).await;
        assert!(out.mutation.is_none());
        assert!(out.output.contains("No active search results"));
    }

    #[tokio::test]
    async fn display_matches_title() {
        let out = run_tool(
            &FakeCatalog,
            DISPLAY_JOB_DETAILS,
            r#"{"title":"product designer"}"#,
            &session_with_results(),
        )
        .await;
        assert_matches!(out.mutation, Some(Mutation::JobSelected { ref job }) if job["jobId"] == "2");
    }

    #[tokio::test]
    async fn display_no_match_is_error() {
        let out = run_tool(
            &FakeCatalog,
            DISPLAY_JOB_DETAILS,
            r#"{"title":"zzzzzzzzzzzzzzzzzzzzzzzzz"}"#,
            &session_with_results(),
        )
        .await;
        assert!(out.mutation.is_none());
        assert!(out.output.contains("No matching job found"));
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_args() {
        let s = session_with_results();
        let out = run_tool(&FakeCatalog, "launch_rockets", "{}", &s).await;
        assert!(out.output.contains("Unknown tool"));
        let out = run_tool(&FakeCatalog, SEARCH_JOBS, "not json", &s).await;
        assert!(out.output.contains("invalid arguments"));
        assert!(out.mutation.is_none());
    }

    #[test]
    fn substring_wins_over_similarity() {
        let results = vec![
            json!({"title": "Software Engineer"}),
            json!({"title": "Senior Software Engineer II"}),
        ];
        let hit = best_title_match(&results, "engineer ii").unwrap();
        assert_eq!(hit["title"], "Senior Software Engineer II");
    }

    #[test]
    fn fuzzy_match_picks_closest() {
        let results = vec![
            json!({"title": "Data Scientist"}),
            json!({"title": "Product Designer"}),
        ];
        let hit = best_title_match(&results, "data scientst").unwrap();
        assert_eq!(hit["title"], "Data Scientist");
    }

    #[test]
    fn job_id_accepts_numbers() {
        assert_eq!(job_id(&json!({"jobId": 7})).as_deref(), Some("7"));
        assert_eq!(job_id(&json!({"id": "x"})).as_deref(), Some("x"));
        assert_eq!(job_id(&json!({"title": "none"})), None);
    }

    #[test]
    fn schemas_name_both_tools() {
        let names: Vec<_> = tool_schemas()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec![SEARCH_JOBS, DISPLAY_JOB_DETAILS]);
    }
}
