//! Composite vectors over directory-registered layouts, driven by random data.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use tessera_core::{MatrixId, RowId};
use tessera_storage::{
    CompositeVector, DenseVector, MatrixLayout, PartitionDirectory, PartitionProvider,
    SortedSparseVector, SparseVector, StorageKind,
};

const DIM: u64 = 10_000;

fn directory() -> PartitionDirectory {
    let directory = PartitionDirectory::new();
    directory.register(MatrixLayout::uniform(MatrixId::new(1), 4, DIM, 2, 4).unwrap());
    directory
}

#[test]
fn test_matches_dense_reference_under_random_updates() {
    let directory = directory();
    let layout = directory.layout(MatrixId::new(1)).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    for kind in [StorageKind::Dense, StorageKind::Sparse, StorageKind::SortedSparse] {
        let mut composite = CompositeVector::for_row(&layout, RowId::new(3), kind).unwrap();
        let mut reference = vec![0.0f64; DIM as usize];

        for _ in 0..2_000 {
            let i = rng.gen_range(0..DIM);
            let delta = rng.gen_range(-5.0..5.0);
            composite.plus_by_index(i, delta).unwrap();
            reference[i as usize] += delta;
        }

        for (i, expected) in reference.iter().enumerate() {
            assert!((composite.get(i as u64).unwrap() - expected).abs() < 1e-9);
        }
        let sum: f64 = reference.iter().sum();
        assert!((composite.sum() - sum).abs() < 1e-6);

        let dense = DenseVector::from_values(reference.clone());
        let norm: f64 = reference.iter().map(|v| v * v).sum();
        assert!((composite.dot(&dense).unwrap() - norm).abs() < 1e-6);
        assert!((composite.squared_norm() - norm).abs() < 1e-6);
    }
}

#[test]
fn test_plus_by_every_operand_shape() {
    let directory = directory();
    let layout = directory.layout(MatrixId::new(1)).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let indexes: Vec<usize> = sample(&mut rng, DIM as usize, 100).into_vec();

    let mut target = CompositeVector::for_row(&layout, RowId::new(0), StorageKind::Sparse).unwrap();
    let mut other =
        CompositeVector::for_row(&layout, RowId::new(0), StorageKind::SortedSparse).unwrap();
    for &i in &indexes {
        other.set(i as u64, 1.0).unwrap();
    }

    let sparse =
        SparseVector::from_pairs(DIM as usize, indexes.iter().map(|&i| (i, 1.0))).unwrap();
    let sorted =
        SortedSparseVector::from_pairs(DIM as usize, indexes.iter().map(|&i| (i, 1.0)).collect())
            .unwrap();
    let mut dense = DenseVector::new(DIM as usize);
    for &i in &indexes {
        dense.set(i, 1.0).unwrap();
    }

    target
        .plus_by(&other, 1.0)
        .unwrap()
        .plus_by(&sparse, 2.0)
        .unwrap()
        .plus_by(&sorted, 3.0)
        .unwrap()
        .plus_by(&dense, 4.0)
        .unwrap();

    for &i in &indexes {
        assert_eq!(target.get(i as u64).unwrap(), 10.0);
    }
    assert_eq!(target.nonzero_count(), 100);
    assert_eq!(target.sum(), 1_000.0);
}

#[test]
fn test_concurrent_snapshot_equals_sequential_result() {
    let directory = directory();
    let layout = directory.layout(MatrixId::new(1)).unwrap();
    let keys = directory
        .list_partitions(MatrixId::new(1), RowId::new(2))
        .unwrap();

    let shared = CompositeVector::for_row(&layout, RowId::new(2), StorageKind::Sparse)
        .unwrap()
        .into_concurrent();
    let mut sequential =
        CompositeVector::for_row(&layout, RowId::new(2), StorageKind::Sparse).unwrap();

    std::thread::scope(|scope| {
        for key in &keys {
            let shared = &shared;
            scope.spawn(move || {
                for col in key.start_col..key.end_col {
                    shared.apply_update(key, &[col], &[col as f64]).unwrap();
                }
            });
        }
    });
    for col in 0..DIM {
        sequential.set(col, col as f64).unwrap();
    }

    assert_eq!(shared.snapshot().sum(), sequential.sum());
    assert_eq!(shared.get(9_999).unwrap(), 9_999.0);
}
