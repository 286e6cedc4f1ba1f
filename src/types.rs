use crate::fetch::{Format, RecordData};
use crate::planner::Progress;
use crate::profile::Profile;
use serde::{Deserialize, Serialize};

/// A page of query results.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Token for the next page, if there is one.
    pub continuation: Option<String>,
    /// Records on this page.
    pub count: usize,
    pub data: RecordData,
    pub index: String,
    pub limit: usize,
    pub page: u32,
    pub profile: Profile,
    pub progress: Progress,
    pub q: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountResult {
    pub count: u64,
    pub index: String,
    pub profile: Profile,
    pub q: Option<String>,
}

/// Distinct keys of a value index.
#[derive(Debug, Clone, Serialize)]
pub struct KeysResult {
    pub count: usize,
    pub data: Vec<String>,
    pub index: String,
    pub limit: Option<usize>,
    pub profile: Profile,
    pub q: Option<String>,
}

/// A configured index and the state of its active generation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub index: String,
    pub prefix: String,
    pub schema: String,
    pub built: bool,
    pub generation: Option<i64>,
    pub rows: Option<u64>,
    /// Commit time of the active generation, milliseconds since the epoch.
    pub built_at: Option<u64>,
}

/// Query parameters for `/api/query`, `/api/all`, `/api/match`, `/api/keys`
/// and `/api/count`.
#[derive(Debug, Deserialize, Default)]
pub struct ApiQuery {
    pub q: Option<String>,
    pub limit: Option<usize>,
    #[serde(alias = "fmt")]
    pub format: Option<String>,
}

/// Query parameters for `/api/cont`.
#[derive(Debug, Deserialize, Default)]
pub struct ContQuery {
    pub token: Option<String>,
    #[serde(alias = "fmt")]
    pub format: Option<String>,
}

/// Parse an optional `format` parameter.
pub fn parse_format(raw: Option<&str>) -> crate::Result<Option<Format>> {
    raw.map(str::parse).transpose()
}
