// ? mpirun -n {{NPROCESSES}} --features "mpi"
//! Explicit heat diffusion on a distributed grid: one halo update and one
//! double-buffered stencil sweep per step. Missing neighbours fall back
//! to the centre value, which makes the world boundary a zero-flux wall,
//! so the total heat is conserved to rounding.

use mpi::collective::SystemOperation;
use mpi::traits::*;

use fieldgrid::FieldGrid;

const STEPS: usize = 50;
const ALPHA: f64 = 0.1;

fn main() {
    let universe = mpi::initialize().expect("transport failed to initialize");
    let world = universe.world();

    let mut grid = FieldGrid::<f64, 1>::new(
        [48, 48, 24],
        &world,
        world.size(),
        [false; 3],
        [1.0; 3],
        [0.0; 3],
        [0, 0, 0],
    )
    .expect("grid construction failed");

    // One hot cell, wherever the global centre happens to live.
    let centre = [24, 24, 12];
    if let Some(local) = grid
        .coordinates()
        .global_to_local(centre[0], centre[1], centre[2])
    {
        *grid.get_mut(local[0], local[1], local[2]).unwrap() = 1000.0;
    }

    let mut next = grid.data().to_vec();
    for _ in 0..STEPS {
        grid.update_ghost_cells();
        grid.par_apply_owned(&mut next, |stencil, data| {
            let centre = data[stencil.center()];
            let neighbours = data[stencil.left()]
                + data[stencil.right()]
                + data[stencil.up()]
                + data[stencil.down()]
                + data[stencil.near()]
                + data[stencil.far()];
            centre + ALPHA * (neighbours - 6.0 * centre)
        });
        grid.data_mut().copy_from_slice(&next);
    }

    let local = grid.local_size();
    let mut owned_heat = 0.0;
    for z in 0..local[2] {
        for y in 0..local[1] {
            for x in 0..local[0] {
                owned_heat += *grid.get(x, y, z).unwrap();
            }
        }
    }

    let send = [owned_heat];
    let mut total = [0.0f64];
    grid.all_reduce_into(&send, &mut total, SystemOperation::sum());

    if grid.rank() == 0 {
        println!("total heat after {STEPS} steps: {:.6}", total[0]);
        assert!((total[0] - 1000.0).abs() < 1e-6);
    }
}
