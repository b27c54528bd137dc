//! Error type for grid construction and transport plumbing.

use crate::types::{Extent, Index, Task};

/// Errors surfaced while building a grid or setting up its transport
/// resources. Steady-state transport failures do not reach this type:
/// they abort the job with a diagnostic instead.
#[derive(thiserror::Error, Debug)]
pub enum GridError {
    /// An explicit decomposition does not multiply to the number of
    /// participating tasks (possibly after the environment override).
    #[error("decomposition {requested:?} covers {product} tasks but {num_tasks} participate")]
    DecompositionMismatch {
        /// The decomposition the caller asked for.
        requested: [Task; 3],
        /// Its product.
        product: i64,
        /// The effective participant count it had to match.
        num_tasks: Task,
    },

    /// No factorization of the task count fits the domain together with
    /// the requested ghost width.
    #[error("cannot decompose {global_size:?} cells over {num_tasks} tasks with ghost width {ghost_width}")]
    NoViableDecomposition {
        /// Global domain extent.
        global_size: [Extent; 3],
        /// Tasks that must share it.
        num_tasks: Task,
        /// Halo width each slab must be able to source.
        ghost_width: Index,
    },

    /// Some slab of the decomposition is too thin to source its
    /// neighbours' ghost cells, or empty outright.
    #[error("axis {axis}: {tasks} tasks leave slabs of {thinnest_cells} cells, fewer than ghost width {ghost_width}")]
    DomainTooThin {
        /// Offending axis.
        axis: usize,
        /// Tasks sharing it.
        tasks: Task,
        /// Cells in the thinnest slab.
        thinnest_cells: Index,
        /// Halo width that no longer fits.
        ghost_width: Index,
    },

    /// The participant-count environment override is not a non-negative
    /// integer.
    #[error("participant override {value:?} is not a non-negative integer")]
    BadProcsOverride {
        /// The raw environment value.
        value: String,
    },

    /// The participant count is zero, negative, or exceeds the parent
    /// communicator.
    #[error("invalid participant count {requested} for a parent communicator of size {parent_size}")]
    ParticipantCount {
        /// Effective participant count requested.
        requested: Task,
        /// Size of the parent communicator.
        parent_size: Task,
    },

    /// A transport call returned a non-success code during construction.
    #[error("{operation} failed with code {code} on rank {rank}")]
    Transport {
        /// The transport operation that failed.
        operation: &'static str,
        /// This task's rank at the time of the call.
        rank: Task,
        /// The code the transport returned.
        code: i32,
    },
}
