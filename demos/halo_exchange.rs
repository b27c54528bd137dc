// ? mpirun -n {{NPROCESSES}} --features "mpi"
//! Builds a periodic grid, fills every owned cell with its global id,
//! runs one ghost-cell update and reports how many halo cells arrived
//! with the value of the cell they mirror.

use mpi::traits::*;

use fieldgrid::{FieldGrid, GlobalId};

fn main() {
    let universe = mpi::initialize().expect("transport failed to initialize");
    let world = universe.world();

    let global = [32u32, 32, 16];
    let periodic = [true, true, false];
    let mut grid = FieldGrid::<GlobalId, 1>::new(
        global,
        &world,
        world.size(),
        periodic,
        [1.0; 3],
        [0.0; 3],
        [0, 0, 0],
    )
    .expect("grid construction failed");

    let local = grid.local_size();
    println!(
        "rank {} of {}: task position {:?}, owns {:?} cells starting at {:?}",
        grid.rank(),
        grid.num_grid_tasks(),
        grid.coordinates().task_position,
        local,
        grid.local_start(),
    );

    for z in 0..local[2] {
        for y in 0..local[1] {
            for x in 0..local[0] {
                let id = grid.coordinates().global_id_from_local_coordinates(x, y, z);
                *grid.get_mut(x, y, z).unwrap() = id;
            }
        }
    }

    grid.update_ghost_cells();

    let start = grid.local_start();
    let mut checked = 0u64;
    let mut matching = 0u64;
    for z in -1..local[2] + 1 {
        for y in -1..local[1] + 1 {
            for x in -1..local[0] + 1 {
                let interior =
                    (0..local[0]).contains(&x) && (0..local[1]).contains(&y) && (0..local[2]).contains(&z);
                if interior {
                    continue;
                }
                let Some(&value) = grid.get(x, y, z) else {
                    continue;
                };

                let mut expected = 0;
                let mut stride = 1;
                let coords = [start[0] + x, start[1] + y, start[2] + z];
                for i in 0..3 {
                    let extent = global[i] as GlobalId;
                    let wrapped = ((coords[i] as GlobalId % extent) + extent) % extent;
                    expected += stride * wrapped;
                    stride *= extent;
                }

                checked += 1;
                if value == expected {
                    matching += 1;
                }
            }
        }
    }

    println!(
        "rank {}: {}/{} halo cells match their owners",
        grid.rank(),
        matching,
        checked
    );
    assert_eq!(matching, checked);
}
