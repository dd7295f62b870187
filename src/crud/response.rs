//! # Response Formatting
//!
//! Shapes returned by the CRUD engine.

use serde::Serialize;

/// One page of records
#[derive(Debug, Clone, Serialize)]
pub struct ListResponse<T: Serialize> {
    pub data: Vec<T>,
    /// Records on this page
    pub count: usize,
    /// Records matching the filters across every page
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

impl<T: Serialize> ListResponse<T> {
    pub fn new(data: Vec<T>, total: u64, limit: usize, offset: usize) -> Self {
        let count = data.len();
        Self {
            data,
            count,
            total,
            limit,
            offset,
        }
    }
}

/// Delete response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
    /// Whether the row was kept with `_deleted_at` set
    pub soft: bool,
}
