use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fieldgrid::{topology, Coordinates, Stencil, StencilConstants};

fn constants() -> StencilConstants {
    // A periodic 64^3 slab on a single task: every direction wraps onto
    // the task itself, so both mask paths stay live in the hot loop.
    let coordinates = Coordinates::new(
        [1.0; 3],
        [0.0; 3],
        [64; 3],
        [true; 3],
        [1, 1, 1],
        [0, 0, 0],
        1,
    );
    let ranks = topology::neighbour_ranks([0, 0, 0], [1, 1, 1], [true; 3]);
    StencilConstants::new(
        &coordinates,
        topology::self_wrap_mask(0, &ranks),
        topology::missing_neighbour_mask(&ranks),
    )
}

fn bench_stencil(c: &mut Criterion) {
    let constants = constants();

    c.bench_function("neighbourhood_indices_64cubed", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            for k in 0..64 {
                for j in 0..64 {
                    for i in 0..64 {
                        let stencil = Stencil::new(black_box([i, j, k]), constants);
                        acc = acc.wrapping_add(stencil.left());
                        acc = acc.wrapping_add(stencil.right());
                        acc = acc.wrapping_add(stencil.up());
                        acc = acc.wrapping_add(stencil.down());
                        acc = acc.wrapping_add(stencil.near());
                        acc = acc.wrapping_add(stencil.far());
                    }
                }
            }
            acc
        })
    });

    c.bench_function("full_27_point_neighbourhood", |b| {
        b.iter(|| {
            let stencil = Stencil::new(black_box([31, 31, 31]), constants);
            stencil.indices()
        })
    });
}

criterion_group!(benches, bench_stencil);
criterion_main!(benches);
