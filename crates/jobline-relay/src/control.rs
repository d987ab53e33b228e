//! Manual browser controls.
//!
//! These bypass the voice model: the change is applied straight through the
//! mutation entry point and broadcast. The returned note lets the bridge
//! tell the assistant what the user just did on screen.

use jobline_core::protocol::{ClientMessage, ManualSearch, SelectJob};
use jobline_core::{Mutation, RelayError, SessionId};
use serde_json::Value;

use crate::bridge::BridgeContext;

#[derive(Clone, Debug, PartialEq)]
pub enum ManualControl {
    Search(ManualSearch),
    Select(SelectJob),
    ShowResults,
    Reset,
}

impl ManualControl {
    /// The control carried by `msg`, if it is one.
    pub fn from_message(msg: ClientMessage) -> Option<Self> {
        match msg {
            ClientMessage::ManualSearch { data } => Some(Self::Search(data)),
            ClientMessage::SelectJob { data } => Some(Self::Select(data)),
            ClientMessage::ViewSearchResults => Some(Self::ShowResults),
            ClientMessage::ResetState => Some(Self::Reset),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Search(_) => "manual_search",
            Self::Select(_) => "select_job",
            Self::ShowResults => "view_search_results",
            Self::Reset => "reset_state",
        }
    }

    /// Apply to `session` and broadcast. Returns a note for the assistant.
    pub async fn apply(self, ctx: &BridgeContext, session: &SessionId) -> Result<String, RelayError> {
        let (mutation, note) = match self {
            Self::Search(search) => {
                let country = search.country.filter(|c| !c.trim().is_empty());
                let page = ctx.catalog.search(&search.query, country.as_deref()).await?;
                let note = search_note(&search.query, country.as_deref(), &page.jobs, page.total);
                (
                    Mutation::SearchCompleted {
                        query: search.query,
                        country,
                        results: page.jobs,
                        total_count: page.total,
                    },
                    note,
                )
            }
            Self::Select(select) => {
                let job = ctx.catalog.job_details(&select.job_id).await?;
                let title = job.get("title").and_then(Value::as_str).unwrap_or("a job");
                let note = format!(
                    "The user opened the details of \"{title}\" on screen. Answer questions about this job."
                );
                (Mutation::JobSelected { job }, note)
            }
            Self::ShowResults => (
                Mutation::ShowResults,
                "The user went back to the search results list on screen.".to_owned(),
            ),
            Self::Reset => (
                Mutation::Reset,
                "The user reset the conversation. Start over and ask what role they are looking for."
                    .to_owned(),
            ),
        };
        let _ = ctx.broadcaster.apply(session, &mutation).await?;
        Ok(note)
    }
}

fn search_note(query: &str, country: Option<&str>, jobs: &[Value], total: u64) -> String {
    let place = country.map(|c| format!(" in {c}")).unwrap_or_default();
    let titles: Vec<&str> = jobs
        .iter()
        .take(jobline_core::session::MAX_RESULTS)
        .filter_map(|j| j.get("title").and_then(Value::as_str))
        .collect();
    if titles.is_empty() {
        return format!("The user searched on screen for \"{query}\"{place} and found no jobs.");
    }
    format!(
        "The user searched on screen for \"{query}\"{place}; {total} jobs matched. Showing: {}.",
        titles.join("; ")
    )
}
