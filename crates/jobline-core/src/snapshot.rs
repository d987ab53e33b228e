//! Full-state snapshots delivered to browser observers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;
use crate::session::{SearchState, ViewMode};

/// Banner as seen by the browser. The browser counts `remaining_seconds`
/// down locally between snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBanner {
    pub text: String,
    pub remaining_seconds: u64,
}

/// The complete UI-relevant state of a session at one store version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub session_id: SessionId,
    pub version: u64,
    pub search: Option<SearchState>,
    pub current_job: Option<Value>,
    pub view_mode: ViewMode,
    pub status_message: Option<StatusBanner>,
}

/// What a browser renders from the last snapshot it applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Screen {
    #[default]
    Blank,
    Results {
        query: String,
        titles: Vec<String>,
        total_count: u64,
    },
    Detail {
        title: String,
    },
}

/// Render-from-snapshot model of a browser observer. The rendered screen is
/// a function of the last snapshot only, never of the history of snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObserverView {
    screen: Screen,
    banner: Option<StatusBanner>,
}

impl ObserverView {
    pub fn apply(&mut self, snapshot: &StateSnapshot) {
        self.screen = match (snapshot.view_mode, &snapshot.current_job, &snapshot.search) {
            (ViewMode::Detail, Some(job), _) => Screen::Detail {
                title: job_title(job),
            },
            (_, _, Some(search)) => Screen::Results {
                query: search.query.clone(),
                titles: search.results.iter().map(job_title).collect(),
                total_count: search.total_count,
            },
            _ => Screen::Blank,
        };
        self.banner.clone_from(&snapshot.status_message);
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn banner(&self) -> Option<&StatusBanner> {
        self.banner.as_ref()
    }
}

fn job_title(job: &Value) -> String {
    job.get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}
