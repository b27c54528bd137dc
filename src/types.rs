//! Shared type aliases and sentinels.

/// Linear id of a cell in the global domain, x varying fastest.
pub type GlobalId = i64;

/// Linear id of a cell in one task's padded local storage.
pub type LocalId = i64;

/// Per-axis extent of the global domain, in cells.
pub type Extent = u32;

/// A cell coordinate along one axis, local or global.
pub type Index = i32;

/// Rank of a task within the grid communicator.
pub type Task = i32;

/// Rank standing in for an absent neighbour or a non-participating task.
pub const NO_TASK: Task = -1;

/// Local id returned for a cell that is not materialized on this task.
pub const INVALID_LOCAL_ID: LocalId = LocalId::MIN;
