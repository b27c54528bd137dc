//! Cartesian task topology: neighbour ranks, halo datatypes and the
//! ghost-cell exchange.

use crate::tools::{self, BitMask32};
use crate::types::{Index, Task, NO_TASK};

#[cfg(feature = "mpi")]
use std::os::raw::{c_int, c_void};

#[cfg(feature = "mpi")]
use itertools::iproduct;
#[cfg(feature = "mpi")]
use mpi::{
    datatype::UserDatatype,
    ffi,
    raw::AsRaw,
    topology::{CartesianCommunicator, Color},
    traits::*,
    Count,
};

#[cfg(feature = "mpi")]
use crate::coordinates::Coordinates;
#[cfg(feature = "mpi")]
use crate::error::GridError;

/// Row-major rank of a task position, the layout the transport assigns
/// when reordering is disabled.
pub fn rank_from_task_position(position: [Task; 3], num_tasks_per_dim: [Task; 3]) -> Task {
    (position[0] * num_tasks_per_dim[1] + position[1]) * num_tasks_per_dim[2] + position[2]
}

/// The 27-entry neighbour-rank table for one task position.
///
/// Entries hold `NO_TASK` where a non-periodic boundary leaves no
/// neighbour. Periodic axes wrap, so an entry may name the task itself.
pub fn neighbour_ranks(
    task_position: [Task; 3],
    num_tasks_per_dim: [Task; 3],
    periodic: [bool; 3],
) -> [Task; 27] {
    let mut ranks = [NO_TASK; 27];
    for (ni, rank) in ranks.iter_mut().enumerate() {
        let delta = [
            tools::linear_to_x(ni as u32),
            tools::linear_to_y(ni as u32),
            tools::linear_to_z(ni as u32),
        ];
        let position: [Task; 3] = std::array::from_fn(|axis| {
            let candidate = task_position[axis] + delta[axis];
            if periodic[axis] {
                (candidate + num_tasks_per_dim[axis]) % num_tasks_per_dim[axis]
            } else {
                candidate
            }
        });
        let inside =
            (0..3).all(|axis| position[axis] >= 0 && position[axis] < num_tasks_per_dim[axis]);
        if inside {
            *rank = rank_from_task_position(position, num_tasks_per_dim);
        }
    }
    ranks
}

/// Dense reverse table mapping a rank to its neighbour index, or -1 for
/// ranks that are not neighbours of this task.
pub fn neighbour_rank_to_index(ranks: &[Task; 27], num_tasks: Task) -> Vec<i8> {
    let mut table = vec![-1i8; num_tasks as usize];
    for (ni, &rank) in ranks.iter().enumerate() {
        if rank >= 0 && rank < num_tasks {
            table[rank as usize] = ni as i8;
        }
    }
    table
}

/// Directions whose neighbour entry wraps back onto the task itself.
///
/// Bit 13 stays clear: the centre entry is trivially self and needs no
/// fold. A non-participating task gets an empty mask.
pub fn self_wrap_mask(rank: Task, ranks: &[Task; 27]) -> BitMask32 {
    if rank == NO_TASK {
        return BitMask32::new(0);
    }
    let mut bits = 0u32;
    for (ni, &neighbour) in ranks.iter().enumerate() {
        if ni != 13 && neighbour == rank {
            bits |= 1 << ni;
        }
    }
    BitMask32::new(bits)
}

/// Directions with no neighbour behind them. Bit 13 stays clear.
pub fn missing_neighbour_mask(ranks: &[Task; 27]) -> BitMask32 {
    let mut bits = 0u32;
    for (ni, &neighbour) in ranks.iter().enumerate() {
        if ni != 13 && neighbour == NO_TASK {
            bits |= 1 << ni;
        }
    }
    BitMask32::new(bits)
}

/// Extent and start, in storage coordinates, of the slab exchanged with
/// the neighbour in direction `delta`.
///
/// `None` for the centre, for any direction that steps along a collapsed
/// axis, and for a zero ghost width: no datatype is built there.
pub fn subarray_geometry(
    storage_size: [Index; 3],
    local_size: [Index; 3],
    ghost_width: Index,
    delta: [Index; 3],
    for_send: bool,
) -> Option<([Index; 3], [Index; 3])> {
    let center = delta == [0, 0, 0];
    let flat = (0..3).any(|i| storage_size[i] == 1 && delta[i] != 0);
    if center || flat || ghost_width == 0 {
        return None;
    }

    let sizes: [Index; 3] =
        std::array::from_fn(|i| if delta[i] == 0 { local_size[i] } else { ghost_width });
    let starts: [Index; 3] = std::array::from_fn(|i| {
        if storage_size[i] == 1 {
            0
        } else if for_send {
            // Owned slab: the high face sits 2w below the storage edge.
            if delta[i] == 1 {
                storage_size[i] - 2 * ghost_width
            } else {
                ghost_width
            }
        } else {
            // Ghost slab on the side the data arrives from.
            match delta[i] {
                1 => 0,
                0 => ghost_width,
                _ => storage_size[i] - ghost_width,
            }
        }
    });
    Some((sizes, starts))
}

/// Owned handle to a committed subarray datatype, freed exactly once.
#[cfg(feature = "mpi")]
pub(crate) struct HaloDatatype(ffi::MPI_Datatype);

#[cfg(feature = "mpi")]
impl HaloDatatype {
    fn as_raw(&self) -> ffi::MPI_Datatype {
        self.0
    }
}

#[cfg(feature = "mpi")]
impl Drop for HaloDatatype {
    fn drop(&mut self) {
        unsafe {
            ffi::MPI_Type_free(&mut self.0);
        }
    }
}

/// Build and commit the subarray datatype for one halo slab.
///
/// The transport wants the slowest-varying axis first; storage is x
/// fastest, so the triplets go in reversed.
#[cfg(feature = "mpi")]
fn commit_subarray(
    storage_size: [Index; 3],
    sizes: [Index; 3],
    starts: [Index; 3],
    element_bytes: usize,
    rank: Task,
) -> Result<HaloDatatype, GridError> {
    let reversed = |a: [Index; 3]| [a[2] as c_int, a[1] as c_int, a[0] as c_int];
    let full = reversed(storage_size);
    let sub = reversed(sizes);
    let start = reversed(starts);

    let base = UserDatatype::contiguous(element_bytes as Count, &u8::equivalent_datatype());
    let mut handle: ffi::MPI_Datatype = unsafe { std::mem::zeroed() };
    let code = unsafe {
        ffi::MPI_Type_create_subarray(
            3,
            full.as_ptr(),
            sub.as_ptr(),
            start.as_ptr(),
            ffi::MPI_ORDER_C as c_int,
            base.as_raw(),
            &mut handle,
        )
    };
    if code != ffi::MPI_SUCCESS as c_int {
        return Err(GridError::Transport {
            operation: "MPI_Type_create_subarray",
            rank,
            code,
        });
    }
    let code = unsafe { ffi::MPI_Type_commit(&mut handle) };
    if code != ffi::MPI_SUCCESS as c_int {
        return Err(GridError::Transport {
            operation: "MPI_Type_commit",
            rank,
            code,
        });
    }
    Ok(HaloDatatype(handle))
}

/// Split the parent communicator and build the Cartesian one over the
/// first `num_tasks` ranks.
///
/// Non-participants come back with no communicator and rank `NO_TASK`;
/// everything they later do against the grid short-circuits.
#[cfg(feature = "mpi")]
pub(crate) fn split_and_create<C: Communicator>(
    parent: &C,
    num_tasks: Task,
    num_tasks_per_dim: [Task; 3],
    periodic: [bool; 3],
) -> Result<(Option<CartesianCommunicator>, Task, [Task; 3]), GridError> {
    let parent_rank = parent.rank();
    let color = if parent_rank < num_tasks {
        Color::with_value(1)
    } else {
        Color::undefined()
    };

    match parent.split_by_color(color) {
        Some(participants) => {
            let dims = num_tasks_per_dim.map(|t| t as Count);
            let cart = participants
                .create_cartesian_communicator(&dims, &periodic, false)
                .ok_or(GridError::Transport {
                    operation: "MPI_Cart_create",
                    rank: parent_rank,
                    code: 0,
                })?;
            let rank = cart.rank();
            let coords = cart.rank_to_coordinates(rank);
            Ok((Some(cart), rank, [coords[0], coords[1], coords[2]]))
        }
        None => Ok((None, NO_TASK, [NO_TASK; 3])),
    }
}

/// Task-position-to-rank table filled on the first rank and broadcast to
/// every task in the parent communicator, participants or not.
///
/// With reordering disabled the Cartesian ranks are row-major over the
/// task grid, so the table is computed rather than queried.
#[cfg(feature = "mpi")]
pub(crate) fn broadcast_task_table<C: Communicator>(
    parent: &C,
    num_tasks_per_dim: [Task; 3],
) -> Vec<Task> {
    let [tx, ty, tz] = num_tasks_per_dim;
    let mut tasks = vec![0 as Task; (tx * ty * tz) as usize];
    if parent.rank() == 0 {
        for (i, (x, y, z)) in iproduct!(0..tx, 0..ty, 0..tz).enumerate() {
            tasks[i] = rank_from_task_position([x, y, z], num_tasks_per_dim);
        }
    }
    parent.process_at_rank(0).broadcast_into(&mut tasks[..]);
    tasks
}

/// Cartesian process topology plus the per-neighbour exchange machinery.
///
/// Owns the communicator and the 54 subarray datatypes; both are released
/// exactly once, either through [`CartesianTopology::finalize`] or drop.
#[cfg(feature = "mpi")]
pub struct CartesianTopology {
    comm: Option<CartesianCommunicator>,
    rank: Task,
    num_tasks: Task,
    neighbour_index_to_rank: [Task; 27],
    neighbour_rank_to_index: Vec<i8>,
    send_types: [Option<HaloDatatype>; 27],
    receive_types: [Option<HaloDatatype>; 27],
    storage_volume: usize,
}

#[cfg(feature = "mpi")]
impl CartesianTopology {
    /// Assemble the topology for one task.
    ///
    /// Fails cleanly: datatypes committed before an error are released on
    /// the way out.
    pub(crate) fn new(
        comm: Option<CartesianCommunicator>,
        rank: Task,
        num_tasks: Task,
        coordinates: &Coordinates,
        element_bytes: usize,
    ) -> Result<Self, GridError> {
        let neighbour_index_to_rank = if rank == NO_TASK {
            [NO_TASK; 27]
        } else {
            neighbour_ranks(
                coordinates.task_position,
                coordinates.num_tasks_per_dim,
                coordinates.periodic,
            )
        };
        let neighbour_rank_to_index = neighbour_rank_to_index(&neighbour_index_to_rank, num_tasks);

        let mut send_types: [Option<HaloDatatype>; 27] = std::array::from_fn(|_| None);
        let mut receive_types: [Option<HaloDatatype>; 27] = std::array::from_fn(|_| None);
        if rank != NO_TASK {
            for (ni, (x, y, z)) in iproduct!(-1..=1, -1..=1, -1..=1).enumerate() {
                let delta = [x, y, z];
                for (types, for_send) in
                    [(&mut send_types, true), (&mut receive_types, false)]
                {
                    if let Some((sizes, starts)) = subarray_geometry(
                        coordinates.storage_size,
                        coordinates.local_size,
                        coordinates.ghost_width,
                        delta,
                        for_send,
                    ) {
                        types[ni] = Some(commit_subarray(
                            coordinates.storage_size,
                            sizes,
                            starts,
                            element_bytes,
                            rank,
                        )?);
                    }
                }
            }
        }

        Ok(Self {
            comm,
            rank,
            num_tasks,
            neighbour_index_to_rank,
            neighbour_rank_to_index,
            send_types,
            receive_types,
            storage_volume: coordinates.storage_volume(),
        })
    }

    /// Rank within the grid communicator, `NO_TASK` for non-participants.
    pub fn rank(&self) -> Task {
        self.rank
    }

    /// Number of participating tasks.
    pub fn num_tasks(&self) -> Task {
        self.num_tasks
    }

    /// The Cartesian communicator, if this task participates.
    pub fn comm(&self) -> Option<&CartesianCommunicator> {
        self.comm.as_ref()
    }

    /// The 27-entry neighbour-rank table.
    pub fn neighbour_index_to_rank(&self) -> &[Task; 27] {
        &self.neighbour_index_to_rank
    }

    /// Neighbour index of a rank, if that rank is a neighbour.
    pub fn neighbour_index_of_rank(&self, rank: Task) -> Option<u32> {
        let entry = *self.neighbour_rank_to_index.get(rank as usize)?;
        (entry >= 0).then_some(entry as u32)
    }

    /// Exchange ghost slabs with every materialized neighbour.
    ///
    /// All receives go up before any send so constrained transports
    /// cannot deadlock, and the direction index doubles as the message
    /// tag so a pair of tasks facing each other across several axes still
    /// match the right slabs. Returns once every slab has arrived and
    /// every send has completed.
    pub(crate) fn exchange_halos<T>(&self, data: &mut [T]) {
        let Some(comm) = &self.comm else {
            return;
        };
        assert_eq!(
            data.len(),
            self.storage_volume,
            "halo exchange buffer has the wrong shape"
        );

        let raw_comm = comm.as_raw();
        let buffer = data.as_mut_ptr() as *mut c_void;
        let mut receive_requests: Vec<ffi::MPI_Request> = Vec::with_capacity(26);
        let mut send_requests: Vec<ffi::MPI_Request> = Vec::with_capacity(26);

        for (shift_id, receive_type) in self.receive_types.iter().enumerate() {
            let source = self.neighbour_index_to_rank[26 - shift_id];
            let Some(receive_type) = receive_type else {
                continue;
            };
            if source == NO_TASK {
                continue;
            }
            let mut request: ffi::MPI_Request = unsafe { std::mem::zeroed() };
            let code = unsafe {
                ffi::MPI_Irecv(
                    buffer,
                    1,
                    receive_type.as_raw(),
                    source as c_int,
                    shift_id as c_int,
                    raw_comm,
                    &mut request,
                )
            };
            self.check_steady(raw_comm, code, "MPI_Irecv", source);
            receive_requests.push(request);
        }

        for (shift_id, send_type) in self.send_types.iter().enumerate() {
            let destination = self.neighbour_index_to_rank[shift_id];
            let Some(send_type) = send_type else {
                continue;
            };
            if destination == NO_TASK {
                continue;
            }
            let mut request: ffi::MPI_Request = unsafe { std::mem::zeroed() };
            let code = unsafe {
                ffi::MPI_Isend(
                    buffer as *const c_void,
                    1,
                    send_type.as_raw(),
                    destination as c_int,
                    shift_id as c_int,
                    raw_comm,
                    &mut request,
                )
            };
            self.check_steady(raw_comm, code, "MPI_Isend", destination);
            send_requests.push(request);
        }

        for (requests, what) in [
            (&mut receive_requests, "MPI_Waitall (receives)"),
            (&mut send_requests, "MPI_Waitall (sends)"),
        ] {
            let mut statuses: Vec<ffi::MPI_Status> =
                vec![unsafe { std::mem::zeroed() }; requests.len()];
            let code = unsafe {
                ffi::MPI_Waitall(
                    requests.len() as c_int,
                    requests.as_mut_ptr(),
                    statuses.as_mut_ptr(),
                )
            };
            self.check_steady(raw_comm, code, what, self.rank);
        }
    }

    /// Abort the whole job on a steady-state transport failure.
    fn check_steady(&self, raw_comm: ffi::MPI_Comm, code: c_int, operation: &str, peer: Task) {
        if code == ffi::MPI_SUCCESS as c_int {
            return;
        }
        eprintln!(
            "rank {}: {} involving task {} failed with code {}",
            self.rank, operation, peer, code
        );
        unsafe {
            ffi::MPI_Abort(raw_comm, code);
        }
    }

    /// Release the communicator and datatype handles. Idempotent: later
    /// calls find nothing left to free.
    pub fn finalize(&mut self) {
        for slot in self.send_types.iter_mut() {
            slot.take();
        }
        for slot in self.receive_types.iter_mut() {
            slot.take();
        }
        self.comm.take();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use itertools::iproduct;

    #[test]
    fn test_rank_is_row_major() {
        let dims = [2, 3, 4];
        let mut expected = 0;
        for (x, y, z) in iproduct!(0..2, 0..3, 0..4) {
            assert_eq!(rank_from_task_position([x, y, z], dims), expected);
            expected += 1;
        }
    }

    #[test]
    fn test_interior_task_has_all_neighbours() {
        let ranks = neighbour_ranks([1, 1, 1], [3, 3, 3], [false; 3]);
        assert!(ranks.iter().all(|&r| r != NO_TASK));
        assert_eq!(ranks[13], 13);
        // -x face neighbour is one x-plane of tasks below.
        assert_eq!(ranks[4], rank_from_task_position([0, 1, 1], [3, 3, 3]));
    }

    #[test]
    fn test_corner_task_without_periodicity() {
        let ranks = neighbour_ranks([0, 0, 0], [2, 2, 2], [false; 3]);
        let present = ranks.iter().filter(|&&r| r != NO_TASK).count();
        // Only the all-non-negative octant of directions survives.
        assert_eq!(present, 8);
        assert_eq!(ranks[13], 0);
        assert_eq!(ranks[26], rank_from_task_position([1, 1, 1], [2, 2, 2]));
        assert_eq!(ranks[0], NO_TASK);
    }

    #[test]
    fn test_periodic_wrap_names_the_opposite_task() {
        let ranks = neighbour_ranks([0, 0, 0], [4, 1, 1], [true, false, false]);
        assert_eq!(ranks[4], rank_from_task_position([3, 0, 0], [4, 1, 1]));
        assert_eq!(ranks[22], rank_from_task_position([1, 0, 0], [4, 1, 1]));
        // y and z still end at the world boundary.
        assert_eq!(ranks[10], NO_TASK);
        assert_eq!(ranks[16], NO_TASK);
    }

    #[test]
    fn test_single_periodic_task_is_its_own_neighbour() {
        let ranks = neighbour_ranks([0, 0, 0], [1, 1, 1], [true; 3]);
        assert!(ranks.iter().all(|&r| r == 0));
    }

    #[test]
    fn test_reverse_table_inverts_the_forward_table() {
        let ranks = neighbour_ranks([1, 1, 1], [3, 3, 3], [false; 3]);
        let reverse = neighbour_rank_to_index(&ranks, 27);
        for (ni, &rank) in ranks.iter().enumerate() {
            assert_eq!(reverse[rank as usize], ni as i8);
        }
    }

    #[test]
    fn test_self_wrap_mask_skips_the_center() {
        let all_self = [1; 27];
        let mask = self_wrap_mask(1, &all_self);
        for ni in 0..27 {
            assert_eq!(mask.bit(ni), u32::from(ni != 13));
        }
    }

    #[test]
    fn test_self_wrap_mask_empty_when_nothing_matches() {
        let mut ranks = [1; 27];
        ranks[13] = 0;
        let mask = self_wrap_mask(0, &ranks);
        for ni in 0..27 {
            assert_eq!(mask.bit(ni), 0);
        }
    }

    #[test]
    fn test_self_wrap_mask_first_and_last() {
        let mut ranks = [1; 27];
        ranks[0] = 0;
        ranks[26] = 0;
        let mask = self_wrap_mask(0, &ranks);
        assert_eq!(mask.bit(0), 1);
        for ni in 1..26 {
            assert_eq!(mask.bit(ni), 0);
        }
        assert_eq!(mask.bit(26), 1);
    }

    #[test]
    fn test_missing_mask_marks_absent_neighbours() {
        let ranks = neighbour_ranks([0, 0, 0], [2, 1, 1], [false; 3]);
        let mask = missing_neighbour_mask(&ranks);
        assert_eq!(mask.bit(13), 0);
        assert_eq!(mask.bit(22), 0); // +x neighbour exists
        assert_eq!(mask.bit(4), 1); // -x is off the world
        assert_eq!(mask.bit(10), 1); // -y likewise
    }

    #[test]
    fn test_send_slabs_sit_inside_the_owned_region() {
        let storage = [12, 14, 16];
        let local = [8, 10, 12];
        let w = 2;
        for (z, y, x) in iproduct!(-1..=1, -1..=1, -1..=1) {
            let delta = [x, y, z];
            let Some((sizes, starts)) = subarray_geometry(storage, local, w, delta, true) else {
                assert_eq!(delta, [0, 0, 0]);
                continue;
            };
            for i in 0..3 {
                let expected = if delta[i] == 0 { local[i] } else { w };
                assert_eq!(sizes[i], expected);
                // Sent cells are owned cells.
                assert!(starts[i] >= w);
                assert!(starts[i] + sizes[i] <= w + local[i]);
            }
        }
    }

    #[test]
    fn test_receive_slabs_sit_in_the_halo() {
        let storage = [12, 14, 16];
        let local = [8, 10, 12];
        let w = 2;
        for (z, y, x) in iproduct!(-1..=1, -1..=1, -1..=1) {
            let delta = [x, y, z];
            let Some((sizes, starts)) = subarray_geometry(storage, local, w, delta, false) else {
                continue;
            };
            for i in 0..3 {
                match delta[i] {
                    0 => assert_eq!(starts[i], w),
                    // The slab for a +d send lands in the low halo of the
                    // receiver, and symmetrically for -d.
                    1 => assert_eq!(starts[i], 0),
                    _ => assert_eq!(starts[i], storage[i] - w),
                }
                assert_eq!(sizes[i], if delta[i] == 0 { local[i] } else { w });
            }
        }
    }

    #[test]
    fn test_collapsed_axes_suppress_their_directions() {
        let storage = [12, 1, 16];
        let local = [8, 1, 12];
        assert!(subarray_geometry(storage, local, 2, [0, 1, 0], true).is_none());
        assert!(subarray_geometry(storage, local, 2, [1, -1, 0], true).is_none());
        let (sizes, starts) = subarray_geometry(storage, local, 2, [1, 0, 0], true).unwrap();
        assert_eq!(sizes[1], 1);
        assert_eq!(starts[1], 0);
        assert_eq!(sizes, [2, 1, 12]);
    }

    #[test]
    fn test_zero_ghost_width_builds_no_slabs() {
        for (z, y, x) in iproduct!(-1..=1, -1..=1, -1..=1) {
            assert!(subarray_geometry([8, 8, 8], [8, 8, 8], 0, [x, y, z], true).is_none());
        }
    }
}
