use serde::{Deserialize, Serialize};

const MAX_LIMIT: u64 = 100;
/// Largest skip a SQL OFFSET can carry.
const MAX_OFFSET: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub skip: u64,
}

fn default_limit() -> u64 { 50 }

impl PaginationParams {
    pub fn new(limit: u64, skip: u64) -> Self {
        Self { limit, skip }
    }

    pub fn offset(&self) -> u64 {
        self.skip.min(MAX_OFFSET)
    }

    pub fn limit(&self) -> u64 {
        self.limit.clamp(1, MAX_LIMIT)
    }

    /// OFFSET/LIMIT pair for SQL, both within `i64`.
    pub fn sql_window(&self) -> (i64, i64) {
        let offset = i64::try_from(self.offset()).unwrap_or(i64::MAX);
        let limit = i64::try_from(self.limit()).unwrap_or(MAX_LIMIT as i64);
        (offset, limit)
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { limit: default_limit(), skip: 0 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Paginated<T: Serialize> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u64,
    pub skip: u64,
}

impl<T: Serialize> Paginated<T> {
    pub fn new(items: Vec<T>, total: u64, params: &PaginationParams) -> Self {
        Self {
            items,
            total,
            limit: params.limit(),
            skip: params.offset(),
        }
    }

    /// Slice an already-ordered collection into one page.
    pub fn from_all(all: Vec<T>, params: &PaginationParams) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(usize::try_from(params.offset()).unwrap_or(usize::MAX))
            .take(params.limit() as usize)
            .collect();
        Self::new(items, total, params)
    }
}
