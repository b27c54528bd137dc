//! The bound grid: geometry, topology, stencil constants and cell
//! storage for one task.

use std::env;
use std::mem;

use mpi::collective::SystemOperation;
use mpi::traits::*;
use rayon::prelude::*;

use crate::coordinates::Coordinates;
use crate::error::GridError;
use crate::stencil::{Stencil, StencilConstants};
use crate::tools;
use crate::topology::{self, CartesianTopology};
use crate::types::{Extent, GlobalId, Index, LocalId, Task, INVALID_LOCAL_ID, NO_TASK};

/// Environment variable capping how many ranks of the parent
/// communicator participate in the grid. Zero or unset leaves the
/// requested count alone.
pub const PROCS_OVERRIDE_ENV: &str = "FSGRID_PROCS";

/// Distributed Cartesian field grid with a `W`-cell ghost halo.
///
/// `T` is the per-cell payload; it crosses task boundaries as raw bytes,
/// so it must be plain data. Structural state never changes after
/// construction; only the payload buffer does.
pub struct FieldGrid<T, const W: usize> {
    coordinates: Coordinates,
    topology: CartesianTopology,
    constants: StencilConstants,
    tasks: Vec<Task>,
    data: Vec<T>,
}

impl<T: Copy + Default, const W: usize> FieldGrid<T, W> {
    /// Build the grid over (at most) `num_tasks` ranks of `parent`.
    ///
    /// A `decomposition` of zeros asks for the surface-minimizing
    /// heuristic. Construction is collective over `parent`; ranks beyond
    /// the participant count get a degenerate grid that answers queries
    /// but owns no cells. Failure propagates with nothing left allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn new<C: Communicator>(
        global_size: [Extent; 3],
        parent: &C,
        num_tasks: Task,
        periodic: [bool; 3],
        physical_grid_spacing: [f64; 3],
        physical_global_start: [f64; 3],
        decomposition: [Task; 3],
    ) -> Result<Self, GridError> {
        let ghost_width = W as Index;
        let num_tasks = effective_num_tasks(num_tasks, parent.size())?;

        let num_tasks_per_dim = if decomposition == [0, 0, 0] {
            tools::compute_domain_decomposition(global_size, num_tasks, ghost_width)?
        } else {
            let product = decomposition.iter().map(|&t| t as i64).product::<i64>();
            if product != num_tasks as i64 {
                return Err(GridError::DecompositionMismatch {
                    requested: decomposition,
                    product,
                    num_tasks,
                });
            }
            decomposition
        };

        // The thinnest slab on an axis is the floor share; judged from
        // global quantities so every rank reaches the same verdict before
        // any communicator exists.
        for axis in 0..3 {
            let extent = global_size[axis] as i64;
            let tasks_on_axis = num_tasks_per_dim[axis] as i64;
            let thinnest = extent / tasks_on_axis;
            if thinnest == 0 || (extent > ghost_width as i64 && thinnest < ghost_width as i64) {
                return Err(GridError::DomainTooThin {
                    axis,
                    tasks: num_tasks_per_dim[axis],
                    thinnest_cells: thinnest as Index,
                    ghost_width,
                });
            }
        }

        let (comm, rank, task_position) =
            topology::split_and_create(parent, num_tasks, num_tasks_per_dim, periodic)?;

        let coordinates = if rank == NO_TASK {
            Coordinates::degenerate(
                physical_grid_spacing,
                physical_global_start,
                global_size,
                periodic,
                num_tasks_per_dim,
                ghost_width,
            )
        } else {
            Coordinates::new(
                physical_grid_spacing,
                physical_global_start,
                global_size,
                periodic,
                num_tasks_per_dim,
                task_position,
                ghost_width,
            )
        };

        let topology =
            CartesianTopology::new(comm, rank, num_tasks, &coordinates, mem::size_of::<T>())?;
        let tasks = topology::broadcast_task_table(parent, num_tasks_per_dim);

        let neighbour_ranks = topology.neighbour_index_to_rank();
        let constants = StencilConstants::new(
            &coordinates,
            topology::self_wrap_mask(rank, neighbour_ranks),
            topology::missing_neighbour_mask(neighbour_ranks),
        );

        let data = vec![T::default(); coordinates.storage_volume()];

        Ok(Self {
            coordinates,
            topology,
            constants,
            tasks,
            data,
        })
    }

    /// Reference to a cell by local coordinates, halo included.
    ///
    /// `None` when the coordinate leaves the materialized block: outside
    /// the halo range, non-zero on a collapsed axis, or behind a missing
    /// neighbour.
    pub fn get(&self, x: Index, y: Index, z: Index) -> Option<&T> {
        let id = self.local_id_from_cell_coordinates(x, y, z);
        if id == INVALID_LOCAL_ID {
            None
        } else {
            self.data.get(id as usize)
        }
    }

    /// Mutable reference to a cell by local coordinates.
    pub fn get_mut(&mut self, x: Index, y: Index, z: Index) -> Option<&mut T> {
        let id = self.local_id_from_cell_coordinates(x, y, z);
        if id == INVALID_LOCAL_ID {
            None
        } else {
            self.data.get_mut(id as usize)
        }
    }

    /// Bounds-checked direct indexing by local id.
    pub fn get_by_local_id(&self, id: LocalId) -> Option<&T> {
        if id < 0 {
            return None;
        }
        self.data.get(id as usize)
    }

    /// Mutable bounds-checked direct indexing by local id.
    pub fn get_by_local_id_mut(&mut self, id: LocalId) -> Option<&mut T> {
        if id < 0 {
            return None;
        }
        self.data.get_mut(id as usize)
    }

    /// Storage id for a cell coordinate that may reach into the halo,
    /// wrap around a periodic boundary, or fall off the world. Absent
    /// cells yield [`INVALID_LOCAL_ID`].
    pub fn local_id_from_cell_coordinates(&self, x: Index, y: Index, z: Index) -> LocalId {
        self.constants.cell_id([x, y, z])
    }

    /// True when `id` addresses a cell of the padded storage block.
    pub fn local_id_in_bounds(&self, id: LocalId) -> bool {
        self.coordinates.local_id_in_bounds(id)
    }

    /// Stencil bound to a centre cell, carrying this grid's constants.
    pub fn make_stencil(&self, x: Index, y: Index, z: Index) -> Stencil {
        Stencil::new([x, y, z], self.constants)
    }

    /// Refresh every ghost cell from the neighbour that owns it.
    ///
    /// Collective over the grid communicator and a full barrier on it: on
    /// return, every owned cell written before the call is visible in the
    /// neighbours' halos. Calling it twice without intervening writes
    /// changes nothing.
    pub fn update_ghost_cells(&mut self) {
        self.topology.exchange_halos(&mut self.data);
    }

    /// The same exchange on an externally owned buffer of storage shape.
    pub fn update_ghost_cells_in(&self, data: &mut [T]) {
        self.topology.exchange_halos(data);
    }

    /// Allreduce over the grid communicator.
    ///
    /// Non-participants copy `sendbuf` into `recvbuf` locally and take no
    /// part in the collective.
    pub fn all_reduce_into<V: Equivalence + Copy>(
        &self,
        sendbuf: &[V],
        recvbuf: &mut [V],
        op: SystemOperation,
    ) {
        match self.topology.comm() {
            Some(comm) => comm.all_reduce_into(sendbuf, recvbuf, &op),
            None => recvbuf.copy_from_slice(sendbuf),
        }
    }

    /// Rank that owns a global cell id, answered from the broadcast
    /// task-position table.
    pub fn task_for_global_id(&self, id: GlobalId) -> Task {
        let position = self.coordinates.global_id_to_task_pos(id);
        let index =
            topology::rank_from_task_position(position, self.coordinates.num_tasks_per_dim);
        self.tasks[index as usize]
    }

    /// Visit every owned cell exactly once, in parallel, with a bound
    /// stencil and the centre payload.
    ///
    /// The grid itself is only read here; anything the body writes it
    /// must keep consistent on its own, and neighbour cells are to be
    /// treated as read-only for the duration of the sweep.
    pub fn par_for_owned_cells<F>(&self, body: F)
    where
        T: Sync,
        F: Fn(Stencil, &T) + Send + Sync,
    {
        let dims = self.coordinates.local_size;
        let constants = self.constants;
        let data = &self.data[..];
        (0..dims[2]).into_par_iter().for_each(|k| {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let stencil = Stencil::new([i, j, k], constants);
                    body(stencil, &data[stencil.center()]);
                }
            }
        });
    }

    /// Compute a new value for every owned cell into `out`, reading the
    /// current storage through the stencil.
    ///
    /// `out` must have storage shape; its ghost cells are left untouched.
    /// This is the sound way to run a read-modify-write sweep: the old
    /// values stay immutable while the new ones land in the other buffer.
    pub fn par_apply_owned<F>(&self, out: &mut [T], body: F)
    where
        T: Send + Sync,
        F: Fn(Stencil, &[T]) -> T + Send + Sync,
    {
        assert_eq!(
            out.len(),
            self.coordinates.storage_volume(),
            "output buffer has the wrong shape"
        );
        if out.is_empty() {
            return;
        }

        let ghost = self.coordinates.ghost_width;
        let storage = self.coordinates.storage_size;
        let local = self.coordinates.local_size;
        let global = self.coordinates.global_size;
        let constants = self.constants;
        let data = &self.data[..];
        let plane = (storage[0] * storage[1]) as usize;

        out.par_chunks_mut(plane)
            .enumerate()
            .for_each(|(plane_index, plane_cells)| {
                let k = if global[2] == 1 {
                    0
                } else {
                    plane_index as Index - ghost
                };
                if k < 0 || k >= local[2] {
                    return;
                }
                for j in 0..local[1] {
                    for i in 0..local[0] {
                        let stencil = Stencil::new([i, j, k], constants);
                        let row = (global[1] > 1) as Index * (ghost + j) * storage[0];
                        let column = (global[0] > 1) as Index * (ghost + i);
                        plane_cells[(row + column) as usize] = body(stencil, data);
                    }
                }
            });
    }

    /// The padded storage block.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable access to the padded storage block.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Owned extent per axis.
    pub fn local_size(&self) -> [Index; 3] {
        self.coordinates.local_size
    }

    /// Global coordinate of the owned origin.
    pub fn local_start(&self) -> [Index; 3] {
        self.coordinates.local_start
    }

    /// Global domain extent.
    pub fn global_size(&self) -> [Extent; 3] {
        self.coordinates.global_size
    }

    /// This task's rank in the grid communicator, `NO_TASK` outside it.
    pub fn rank(&self) -> Task {
        self.topology.rank()
    }

    /// Number of participating tasks.
    pub fn num_grid_tasks(&self) -> Task {
        self.topology.num_tasks()
    }

    /// Whether this task holds a slab of the domain.
    pub fn is_participant(&self) -> bool {
        self.rank() != NO_TASK
    }

    /// Per-axis periodicity.
    pub fn periodic(&self) -> [bool; 3] {
        self.coordinates.periodic
    }

    /// Shape of the task grid.
    pub fn decomposition(&self) -> [Task; 3] {
        self.coordinates.num_tasks_per_dim
    }

    /// Physical size of one cell.
    pub fn grid_spacing(&self) -> [f64; 3] {
        self.coordinates.physical_grid_spacing
    }

    /// The full geometry descriptor.
    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    /// The 27-entry neighbour-rank table.
    pub fn neighbour_ranks(&self) -> &[Task; 27] {
        self.topology.neighbour_index_to_rank()
    }

    /// Release communicator and datatype handles early. Idempotent, and
    /// implied by drop.
    pub fn finalize(&mut self) {
        self.topology.finalize();
    }
}

/// Resolve the participant count against the environment override and
/// the parent communicator size.
fn effective_num_tasks(requested: Task, parent_size: Task) -> Result<Task, GridError> {
    let capped = match env::var(PROCS_OVERRIDE_ENV) {
        Ok(value) => match value.parse::<Task>() {
            Ok(cap) if cap > 0 => requested.min(cap),
            Ok(0) => requested,
            _ => return Err(GridError::BadProcsOverride { value }),
        },
        Err(_) => requested,
    };
    if capped <= 0 || capped > parent_size {
        return Err(GridError::ParticipantCount {
            requested: capped,
            parent_size,
        });
    }
    Ok(capped)
}
