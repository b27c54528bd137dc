//! Branch-free addressing of the 27-cell neighbourhood around a centre.

use itertools::iproduct;

use crate::coordinates::Coordinates;
use crate::tools::{self, BitMask32};
use crate::types::{Index, LocalId, INVALID_LOCAL_ID};

/// Precomputed per-grid constants feeding the branch-free index math.
///
/// The two masks encode the whole neighbour policy, keyed by the
/// flattened locality triplet: a set shift bit means the direction wraps
/// back onto this task's own cells, a set fallback bit means there is no
/// cell behind the direction at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct StencilConstants {
    /// Owned extent per axis; queries at or past it select a neighbour.
    pub limits: [Index; 3],
    /// Storage stride per axis, zeroed on collapsed axes.
    pub multipliers: [Index; 3],
    /// Storage offset of the owned cell (0, 0, 0).
    pub offset: Index,
    /// Ghost-cell halo width.
    pub ghost_width: Index,
    /// Directions whose neighbour is this task itself via periodic wrap.
    pub shift: BitMask32,
    /// Directions with no neighbour behind them.
    pub fallback_to_center: BitMask32,
}

impl StencilConstants {
    /// Derive the constants for one task's geometry and neighbour masks.
    pub fn new(coordinates: &Coordinates, shift: BitMask32, fallback_to_center: BitMask32) -> Self {
        let multipliers = [
            (coordinates.global_size[0] > 1) as Index,
            (coordinates.global_size[1] > 1) as Index * coordinates.storage_size[0],
            (coordinates.global_size[2] > 1) as Index
                * coordinates.storage_size[0]
                * coordinates.storage_size[1],
        ];
        let offset = coordinates.ghost_width * (multipliers[0] + multipliers[1] + multipliers[2]);
        Self {
            limits: coordinates.local_size,
            multipliers,
            offset,
            ghost_width: coordinates.ghost_width,
            shift,
            fallback_to_center,
        }
    }

    /// Checked storage id for a cell coordinate that may reach into the
    /// halo, wrap around a periodic boundary, or fall off the world.
    ///
    /// Returns the invalid sentinel for coordinates outside the halo
    /// range, non-zero coordinates on collapsed axes, and directions with
    /// no neighbour behind them.
    pub fn cell_id(&self, q: [Index; 3]) -> LocalId {
        for i in 0..3 {
            if self.multipliers[i] == 0 {
                if q[i] != 0 {
                    return INVALID_LOCAL_ID;
                }
            } else if q[i] < -self.ghost_width || q[i] >= self.limits[i] + self.ghost_width {
                return INVALID_LOCAL_ID;
            }
        }

        let d: [Index; 3] =
            std::array::from_fn(|i| (q[i] >= self.limits[i]) as Index - (q[i] < 0) as Index);
        let ni = tools::xyz_to_linear(d[0], d[1], d[2]);
        if self.fallback_to_center.bit(ni) == 1 {
            return INVALID_LOCAL_ID;
        }
        let shift = self.shift.bit(ni) as Index;

        let mut id = self.offset as LocalId;
        for i in 0..3 {
            let folded = q[i] - shift * d[i] * self.limits[i];
            id += self.multipliers[i] as LocalId * folded as LocalId;
        }
        id
    }
}

/// A 27-point neighbourhood bound to one centre cell.
///
/// Offsets come out of a handful of integer operations with no branches,
/// so the accessors stay cheap inside inner loops and vectorize.
#[derive(Clone, Copy, Debug)]
pub struct Stencil {
    center: [Index; 3],
    constants: StencilConstants,
}

impl Stencil {
    /// Bind a centre cell to a grid's constants.
    pub fn new(center: [Index; 3], constants: StencilConstants) -> Self {
        Self { center, constants }
    }

    /// Storage offset of an arbitrary cell coordinate near the centre.
    ///
    /// Valid for coordinates within the halo range on each axis (and zero
    /// on collapsed axes). Queries into a direction with no neighbour
    /// resolve to the centre cell.
    pub fn index_of(&self, q: [Index; 3]) -> usize {
        let c = &self.constants;
        let d: [Index; 3] =
            std::array::from_fn(|i| (q[i] >= c.limits[i]) as Index - (q[i] < 0) as Index);
        let ni = tools::xyz_to_linear(d[0], d[1], d[2]);
        let fallback = c.fallback_to_center.bit(ni) as Index;
        let valid = fallback ^ 1;
        let shift = c.shift.bit(ni) as Index;

        let mut acc = c.offset;
        for i in 0..3 {
            let folded = valid * (q[i] - shift * d[i] * c.limits[i]) + fallback * self.center[i];
            acc += c.multipliers[i] * folded;
        }
        acc as usize
    }

    /// Offset of the cell displaced from the centre by `delta`.
    pub fn at(&self, delta: [Index; 3]) -> usize {
        self.index_of([
            self.center[0] + delta[0],
            self.center[1] + delta[1],
            self.center[2] + delta[2],
        ])
    }

    /// Whether a cell is materialized behind the direction `delta`.
    pub fn cell_exists(&self, delta: [Index; 3]) -> bool {
        self.constants
            .fallback_to_center
            .bit(tools::xyz_to_linear(delta[0], delta[1], delta[2]))
            == 0
    }

    /// All 27 offsets, x varying fastest, then y, then z.
    pub fn indices(&self) -> [usize; 27] {
        let mut out = [0usize; 27];
        for (n, (dz, dy, dx)) in iproduct!(-1..=1, -1..=1, -1..=1).enumerate() {
            out[n] = self.at([dx, dy, dz]);
        }
        out
    }

    /// The centre cell itself.
    pub fn center(&self) -> usize {
        self.index_of(self.center)
    }

    /// +z of the centre.
    pub fn near(&self) -> usize {
        self.at([0, 0, 1])
    }

    /// -z of the centre.
    pub fn far(&self) -> usize {
        self.at([0, 0, -1])
    }

    /// +y of the centre.
    pub fn up(&self) -> usize {
        self.at([0, 1, 0])
    }

    /// +y +z.
    pub fn upnear(&self) -> usize {
        self.at([0, 1, 1])
    }

    /// +y -z.
    pub fn upfar(&self) -> usize {
        self.at([0, 1, -1])
    }

    /// -y of the centre.
    pub fn down(&self) -> usize {
        self.at([0, -1, 0])
    }

    /// -y +z.
    pub fn downnear(&self) -> usize {
        self.at([0, -1, 1])
    }

    /// -y -z.
    pub fn downfar(&self) -> usize {
        self.at([0, -1, -1])
    }

    /// +x of the centre.
    pub fn right(&self) -> usize {
        self.at([1, 0, 0])
    }

    /// +x +z.
    pub fn rightnear(&self) -> usize {
        self.at([1, 0, 1])
    }

    /// +x -z.
    pub fn rightfar(&self) -> usize {
        self.at([1, 0, -1])
    }

    /// +x +y.
    pub fn rightup(&self) -> usize {
        self.at([1, 1, 0])
    }

    /// +x +y +z.
    pub fn rightupnear(&self) -> usize {
        self.at([1, 1, 1])
    }

    /// +x +y -z.
    pub fn rightupfar(&self) -> usize {
        self.at([1, 1, -1])
    }

    /// +x -y.
    pub fn rightdown(&self) -> usize {
        self.at([1, -1, 0])
    }

    /// +x -y +z.
    pub fn rightdownnear(&self) -> usize {
        self.at([1, -1, 1])
    }

    /// +x -y -z.
    pub fn rightdownfar(&self) -> usize {
        self.at([1, -1, -1])
    }

    /// -x of the centre.
    pub fn left(&self) -> usize {
        self.at([-1, 0, 0])
    }

    /// -x +z.
    pub fn leftnear(&self) -> usize {
        self.at([-1, 0, 1])
    }

    /// -x -z.
    pub fn leftfar(&self) -> usize {
        self.at([-1, 0, -1])
    }

    /// -x +y.
    pub fn leftup(&self) -> usize {
        self.at([-1, 1, 0])
    }

    /// -x +y +z.
    pub fn leftupnear(&self) -> usize {
        self.at([-1, 1, 1])
    }

    /// -x +y -z.
    pub fn leftupfar(&self) -> usize {
        self.at([-1, 1, -1])
    }

    /// -x -y.
    pub fn leftdown(&self) -> usize {
        self.at([-1, -1, 0])
    }

    /// -x -y +z.
    pub fn leftdownnear(&self) -> usize {
        self.at([-1, -1, 1])
    }

    /// -x -y -z.
    pub fn leftdownfar(&self) -> usize {
        self.at([-1, -1, -1])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology;
    use crate::types::Task;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cube(extent: u32, ghost_width: Index, periodic: bool) -> Coordinates {
        Coordinates::new(
            [1.0; 3],
            [0.0; 3],
            [extent; 3],
            [periodic; 3],
            [1, 1, 1],
            [0, 0, 0],
            ghost_width,
        )
    }

    fn constants_for(coordinates: &Coordinates, rank: Task) -> StencilConstants {
        let ranks = topology::neighbour_ranks(
            coordinates.task_position,
            coordinates.num_tasks_per_dim,
            coordinates.periodic,
        );
        StencilConstants::new(
            coordinates,
            topology::self_wrap_mask(rank, &ranks),
            topology::missing_neighbour_mask(&ranks),
        )
    }

    #[test]
    fn test_bare_cube_indices_count_up() {
        // 3x3x3 without a halo: the neighbourhood of the middle cell is
        // the whole storage block in storage order.
        let coords = cube(3, 0, false);
        let stencil = Stencil::new([1, 1, 1], constants_for(&coords, 0));
        for (n, id) in stencil.indices().into_iter().enumerate() {
            assert_eq!(id, n);
        }
    }

    #[test]
    fn test_padded_cube_indices() {
        // A 3x3x3 slab with a one-cell halo stores 5x5x5. On a task with
        // distinct neighbours on every side the neighbourhood of the owned
        // origin spans the three lowest storage planes verbatim.
        let coords = Coordinates::new(
            [1.0; 3],
            [0.0; 3],
            [9, 9, 9],
            [false; 3],
            [3, 3, 3],
            [1, 1, 1],
            1,
        );
        let rank = topology::rank_from_task_position([1, 1, 1], [3, 3, 3]);
        let stencil = Stencil::new([0, 0, 0], constants_for(&coords, rank));
        let expected = [
            0, 1, 2, 5, 6, 7, 10, 11, 12, // z = 0
            25, 26, 27, 30, 31, 32, 35, 36, 37, // z = 1
            50, 51, 52, 55, 56, 57, 60, 61, 62, // z = 2
        ];
        assert_eq!(stencil.indices(), expected);
    }

    #[test]
    fn test_indices_match_the_accessors() {
        let coords = cube(8, 2, true);
        let stencil = Stencil::new([3, 4, 5], constants_for(&coords, 0));
        let ids = stencil.indices();
        assert_eq!(ids[0], stencil.leftdownfar());
        assert_eq!(ids[1], stencil.downfar());
        assert_eq!(ids[2], stencil.rightdownfar());
        assert_eq!(ids[3], stencil.leftfar());
        assert_eq!(ids[4], stencil.far());
        assert_eq!(ids[5], stencil.rightfar());
        assert_eq!(ids[9], stencil.leftdown());
        assert_eq!(ids[10], stencil.down());
        assert_eq!(ids[12], stencil.left());
        assert_eq!(ids[13], stencil.center());
        assert_eq!(ids[14], stencil.right());
        assert_eq!(ids[16], stencil.up());
        assert_eq!(ids[22], stencil.near());
        assert_eq!(ids[25], stencil.upnear());
        assert_eq!(ids[26], stencil.rightupnear());
    }

    #[test]
    fn test_interior_accessors_are_plain_affine() {
        let coords = cube(8, 1, false);
        let constants = constants_for(&coords, 0);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let c: [Index; 3] = std::array::from_fn(|_| rng.gen_range(1..7));
            let stencil = Stencil::new(c, constants);
            for (dz, dy, dx) in itertools::iproduct!(-1..=1, -1..=1, -1..=1) {
                let expected = (c[0] + dx + 1) + 10 * (c[1] + dy + 1) + 100 * (c[2] + dz + 1);
                assert_eq!(stencil.at([dx, dy, dz]), expected as usize);
            }
        }
    }

    #[test]
    fn test_periodic_wrap_folds_into_owned_cells() {
        // A single periodic task is its own neighbour everywhere, so halo
        // queries land on the opposite owned slab.
        let coords = cube(8, 1, true);
        let stencil = Stencil::new([0, 0, 0], constants_for(&coords, 0));
        assert_eq!(stencil.left(), stencil.index_of([7, 0, 0]));
        assert_eq!(stencil.down(), stencil.index_of([0, 7, 0]));
        assert_eq!(stencil.far(), stencil.index_of([0, 0, 7]));
        assert_eq!(stencil.leftdownfar(), stencil.index_of([7, 7, 7]));
    }

    #[test]
    fn test_missing_neighbours_fall_back_to_the_center() {
        let coords = cube(8, 1, false);
        let stencil = Stencil::new([0, 0, 0], constants_for(&coords, 0));
        assert_eq!(stencil.left(), stencil.center());
        assert_eq!(stencil.downfar(), stencil.center());
        assert_eq!(stencil.leftdownfar(), stencil.center());
        // The high side of the domain is equally missing on one task.
        assert_eq!(
            Stencil::new([7, 7, 7], constants_for(&coords, 0)).rightupnear(),
            Stencil::new([7, 7, 7], constants_for(&coords, 0)).center()
        );
    }

    #[test]
    fn test_cell_exists_mirrors_the_fallback_mask() {
        let coords = cube(8, 1, false);
        let constants = constants_for(&coords, 0);
        let stencil = Stencil::new([0, 0, 0], constants);
        for (dz, dy, dx) in itertools::iproduct!(-1..=1, -1..=1, -1..=1) {
            let ni = tools::xyz_to_linear(dx, dy, dz);
            assert_eq!(
                stencil.cell_exists([dx, dy, dz]),
                constants.fallback_to_center.bit(ni) == 0
            );
        }
        assert!(stencil.cell_exists([0, 0, 0]));
        assert!(!stencil.cell_exists([-1, 0, 0]));
        assert!(!stencil.cell_exists([1, 0, 0]));

        // A split axis materializes the neighbour that actually exists.
        let split = Coordinates::new(
            [1.0; 3],
            [0.0; 3],
            [16, 8, 8],
            [false; 3],
            [2, 1, 1],
            [0, 0, 0],
            1,
        );
        let stencil = Stencil::new([0, 0, 0], constants_for(&split, 0));
        assert!(stencil.cell_exists([1, 0, 0]));
        assert!(!stencil.cell_exists([-1, 0, 0]));
    }

    #[test]
    fn test_offsets_stay_inside_storage() {
        let coords = cube(8, 2, true);
        let constants = constants_for(&coords, 0);
        let volume = coords.storage_volume();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..500 {
            let c: [Index; 3] = std::array::from_fn(|_| rng.gen_range(0..8));
            let stencil = Stencil::new(c, constants);
            for id in stencil.indices() {
                assert!(id < volume);
            }
        }
    }

    mod cell_id {
        use super::*;

        const VALUE: LocalId = INVALID_LOCAL_ID;

        fn split_constants(position: Task) -> StencilConstants {
            let coords = Coordinates::new(
                [1.0; 3],
                [0.0; 3],
                [1048, 11, 5],
                [false; 3],
                [8, 1, 1],
                [position, 0, 0],
                2,
            );
            let rank = topology::rank_from_task_position(coords.task_position, [8, 1, 1]);
            constants_for(&coords, rank)
        }

        fn probe(constants: &StencilConstants) -> Vec<LocalId> {
            let corners = |extent: Index| [-2, 0, extent + 1];
            let mut out = Vec::new();
            for x in corners(131) {
                for y in corners(11) {
                    for z in corners(5) {
                        out.push(constants.cell_id([x, y, z]));
                    }
                }
            }
            out
        }

        #[test]
        fn test_first_task_sees_only_its_high_neighbour() {
            let ids = probe(&split_constants(0));
            let expected = vec![
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, 135 * 15 * 2 + 135 * 2 + 2, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, 135 * 15 * 2 + 135 * 2 + 134, VALUE,
                VALUE, VALUE, VALUE,
            ];
            assert_eq!(ids, expected);
        }

        #[test]
        fn test_middle_tasks_see_both_x_neighbours() {
            for position in 1..7 {
                let ids = probe(&split_constants(position));
                let expected = vec![
                    VALUE, VALUE, VALUE,
                    VALUE, 135 * 15 * 2 + 135 * 2, VALUE,
                    VALUE, VALUE, VALUE,
                    VALUE, VALUE, VALUE,
                    VALUE, 135 * 15 * 2 + 135 * 2 + 2, VALUE,
                    VALUE, VALUE, VALUE,
                    VALUE, VALUE, VALUE,
                    VALUE, 135 * 15 * 2 + 135 * 2 + 134, VALUE,
                    VALUE, VALUE, VALUE,
                ];
                assert_eq!(ids, expected);
            }
        }

        #[test]
        fn test_last_task_sees_only_its_low_neighbour() {
            let ids = probe(&split_constants(7));
            let expected = vec![
                VALUE, VALUE, VALUE,
                VALUE, 135 * 15 * 2 + 135 * 2, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, 135 * 15 * 2 + 135 * 2 + 2, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
                VALUE, VALUE, VALUE,
            ];
            assert_eq!(ids, expected);
        }

        #[test]
        fn test_out_of_range_coordinates_are_invalid() {
            let constants = split_constants(3);
            assert_eq!(constants.cell_id([-3, 0, 0]), VALUE);
            assert_eq!(constants.cell_id([133, 0, 0]), VALUE);
            assert_ne!(constants.cell_id([132, 0, 0]), VALUE);
            assert_ne!(constants.cell_id([-2, 0, 0]), VALUE);
        }

        #[test]
        fn test_collapsed_axes_only_accept_zero() {
            let coords = Coordinates::new(
                [1.0; 3],
                [0.0; 3],
                [64, 1, 64],
                [true; 3],
                [1, 1, 1],
                [0, 0, 0],
                1,
            );
            let constants = constants_for(&coords, 0);
            assert_ne!(constants.cell_id([0, 0, 0]), VALUE);
            assert_eq!(constants.cell_id([0, 1, 0]), VALUE);
            assert_eq!(constants.cell_id([0, -1, 0]), VALUE);
        }
    }
}
