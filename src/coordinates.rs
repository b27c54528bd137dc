//! Per-task geometry: where this task's slab sits in the global domain.

use crate::tools;
use crate::types::{Extent, GlobalId, Index, LocalId, Task, NO_TASK};

/// Immutable descriptor of one task's place in the decomposition.
///
/// Everything here is fixed when the grid is built; only the cell payload
/// buffer ever mutates.
#[derive(Clone, Debug)]
pub struct Coordinates {
    /// Physical size of one cell along each axis.
    pub physical_grid_spacing: [f64; 3],
    /// Physical position of the global cell (0, 0, 0).
    pub physical_global_start: [f64; 3],
    /// Global domain extent, in cells.
    pub global_size: [Extent; 3],
    /// Per-axis periodicity.
    pub periodic: [bool; 3],
    /// Shape of the task grid.
    pub num_tasks_per_dim: [Task; 3],
    /// This task's position in the task grid.
    pub task_position: [Task; 3],
    /// Owned extent per axis, without ghost cells.
    pub local_size: [Index; 3],
    /// Global coordinate of the owned origin.
    pub local_start: [Index; 3],
    /// Extent of the padded storage block per axis.
    pub storage_size: [Index; 3],
    /// Ghost-cell halo width.
    pub ghost_width: Index,
}

impl Coordinates {
    /// Geometry of the task at `task_position`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        physical_grid_spacing: [f64; 3],
        physical_global_start: [f64; 3],
        global_size: [Extent; 3],
        periodic: [bool; 3],
        num_tasks_per_dim: [Task; 3],
        task_position: [Task; 3],
        ghost_width: Index,
    ) -> Self {
        let mut local_size = [0; 3];
        let mut local_start = [0; 3];
        let mut storage_size = [0; 3];
        for i in 0..3 {
            local_size[i] =
                tools::calc_local_size(global_size[i], num_tasks_per_dim[i], task_position[i]);
            local_start[i] =
                tools::calc_local_start(global_size[i], num_tasks_per_dim[i], task_position[i]);
            storage_size[i] = if global_size[i] == 1 {
                1
            } else {
                local_size[i] + 2 * ghost_width
            };
        }
        Self {
            physical_grid_spacing,
            physical_global_start,
            global_size,
            periodic,
            num_tasks_per_dim,
            task_position,
            local_size,
            local_start,
            storage_size,
            ghost_width,
        }
    }

    /// Geometry of a task outside the participant set: it owns nothing
    /// and stores nothing.
    pub fn degenerate(
        physical_grid_spacing: [f64; 3],
        physical_global_start: [f64; 3],
        global_size: [Extent; 3],
        periodic: [bool; 3],
        num_tasks_per_dim: [Task; 3],
        ghost_width: Index,
    ) -> Self {
        Self {
            physical_grid_spacing,
            physical_global_start,
            global_size,
            periodic,
            num_tasks_per_dim,
            task_position: [NO_TASK; 3],
            local_size: [0; 3],
            local_start: [0; 3],
            storage_size: [0; 3],
            ghost_width,
        }
    }

    /// Linear index into the padded storage block.
    ///
    /// Assumes each coordinate lies within the halo range of its axis and
    /// is zero on collapsed axes; no wrap or neighbour resolution happens
    /// here.
    pub fn local_id_from_local_coordinates(&self, x: Index, y: Index, z: Index) -> LocalId {
        let coords = [x, y, z];
        let mut id: LocalId = 0;
        let mut stride: LocalId = 1;
        for i in 0..3 {
            if self.global_size[i] > 1 {
                id += stride * (self.ghost_width + coords[i]) as LocalId;
            }
            stride *= self.storage_size[i] as LocalId;
        }
        id
    }

    /// Global linear id of an owned cell.
    pub fn global_id_from_local_coordinates(&self, x: Index, y: Index, z: Index) -> GlobalId {
        let [gx, gy, gz] = self.local_to_global(x, y, z);
        gx as GlobalId
            + self.global_size[0] as GlobalId * gy as GlobalId
            + self.global_size[0] as GlobalId * self.global_size[1] as GlobalId * gz as GlobalId
    }

    /// Global cell coordinate of a local one.
    pub fn local_to_global(&self, x: Index, y: Index, z: Index) -> [Index; 3] {
        [
            self.local_start[0] + x,
            self.local_start[1] + y,
            self.local_start[2] + z,
        ]
    }

    /// Local coordinates of a global cell when this task owns it.
    pub fn global_to_local(&self, x: Index, y: Index, z: Index) -> Option<[Index; 3]> {
        let local = [
            x - self.local_start[0],
            y - self.local_start[1],
            z - self.local_start[2],
        ];
        let owned = (0..3).all(|i| local[i] >= 0 && local[i] < self.local_size[i]);
        owned.then_some(local)
    }

    /// Physical position of a local cell's origin corner.
    pub fn physical_coords(&self, x: Index, y: Index, z: Index) -> [f64; 3] {
        let global = self.local_to_global(x, y, z);
        std::array::from_fn(|i| {
            self.physical_global_start[i] + global[i] as f64 * self.physical_grid_spacing[i]
        })
    }

    /// Global cell containing a physical position.
    pub fn physical_to_global(&self, position: [f64; 3]) -> [Index; 3] {
        std::array::from_fn(|i| {
            ((position[i] - self.physical_global_start[i]) / self.physical_grid_spacing[i]).floor()
                as Index
        })
    }

    /// Fractional global cell coordinate of a physical position.
    pub fn physical_to_fractional_global(&self, position: [f64; 3]) -> [f64; 3] {
        std::array::from_fn(|i| {
            (position[i] - self.physical_global_start[i]) / self.physical_grid_spacing[i]
        })
    }

    /// Task-grid position of the task owning a global cell id.
    pub fn global_id_to_task_pos(&self, id: GlobalId) -> [Task; 3] {
        let cell = tools::global_id_to_global_coord(id, self.global_size);
        std::array::from_fn(|i| {
            let per_task = self.global_size[i] as Index / self.num_tasks_per_dim[i];
            let remainder = self.global_size[i] as Index % self.num_tasks_per_dim[i];
            if cell[i] < remainder * (per_task + 1) {
                cell[i] / (per_task + 1)
            } else {
                remainder + (cell[i] - remainder * (per_task + 1)) / per_task
            }
        })
    }

    /// Which neighbour direction a cell coordinate falls into, flattened.
    pub fn neighbour_index_from_cell_coordinates(&self, x: Index, y: Index, z: Index) -> u32 {
        let coords = [x, y, z];
        let d: [Index; 3] = std::array::from_fn(|i| {
            (coords[i] >= self.local_size[i]) as Index - (coords[i] < 0) as Index
        });
        tools::xyz_to_linear(d[0], d[1], d[2])
    }

    /// Fold a halo coordinate back into the owned range on every axis it
    /// indexes past, for directions that wrap onto this task itself.
    pub fn shifted_cell_indices(&self, x: Index, y: Index, z: Index) -> [Index; 3] {
        let coords = [x, y, z];
        std::array::from_fn(|i| {
            let d = (coords[i] >= self.local_size[i]) as Index - (coords[i] < 0) as Index;
            coords[i] - d * self.local_size[i]
        })
    }

    /// True when a local id addresses a cell of the padded storage block.
    pub fn local_id_in_bounds(&self, id: LocalId) -> bool {
        id >= 0 && (id as u64) < self.storage_volume() as u64
    }

    /// Number of cells in the padded storage block.
    pub fn storage_volume(&self) -> usize {
        self.storage_size.iter().map(|&s| s as usize).product()
    }
}
