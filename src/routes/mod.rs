use serde::Deserialize;

pub mod health;
pub mod metrics;
pub mod orders;
pub mod products;
pub mod repository;

pub use repository::Repository;

/// 列表接口单页上限
const MAX_PAGE_SIZE: usize = 100;

/// 列表分页参数
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl Pagination {
    pub fn skip(&self) -> usize {
        self.skip.unwrap_or(0)
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE)
    }
}
