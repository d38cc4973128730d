//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::OutboxKind;

/// Due outbox row handed to the worker.
#[derive(Debug, Clone)]
pub struct OutboxTask {
    pub id: i64,
    pub kind: Option<OutboxKind>,
    pub raw_kind: String,
    pub ref_id: i64,
    pub attempt: i32,
}
