//! Composite vector shared between dispatch workers.
//!
//! Every partition's storage sits behind its own lock, so sub-requests for
//! different partitions of the same row never contend. There is no lock over
//! the whole vector.

use super::{CompositeVector, PhysicalVector};
use parking_lot::Mutex;
use tessera_core::{MatrixId, PartitionKey, Result, RowId, ShardError};

/// A [`CompositeVector`] with per-partition mutual exclusion.
#[derive(Debug)]
pub struct ConcurrentCompositeVector {
    matrix_id: MatrixId,
    row_id: RowId,
    dim: u64,
    keys: Vec<PartitionKey>,
    starts: Vec<u64>,
    slots: Vec<Mutex<PhysicalVector>>,
}

impl ConcurrentCompositeVector {
    pub fn matrix_id(&self) -> MatrixId {
        self.matrix_id
    }

    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    pub fn dim(&self) -> u64 {
        self.dim
    }

    /// Partition keys in column order.
    pub fn keys(&self) -> &[PartitionKey] {
        &self.keys
    }

    fn position(&self, key: &PartitionKey) -> Result<usize> {
        match self.starts.binary_search(&key.start_col) {
            Ok(pos) if self.keys[pos] == *key => Ok(pos),
            _ => Err(ShardError::PartitionUnavailable {
                partition: *key,
                reason: format!("not hosted by vector {}/{}", self.matrix_id, self.row_id),
            }),
        }
    }

    fn local(key: &PartitionKey, index: u64) -> Result<usize> {
        key.local_index(index).ok_or(ShardError::OutOfRange {
            index,
            lower: key.start_col,
            upper: key.end_col,
        })
    }

    /// Reads a single element by global index.
    pub fn get(&self, index: u64) -> Result<f64> {
        if index >= self.dim {
            return Err(ShardError::OutOfRange {
                index,
                lower: 0,
                upper: self.dim,
            });
        }
        let pos = self.starts.partition_point(|&s| s <= index) - 1;
        let local = (index - self.starts[pos]) as usize;
        Ok(self.slots[pos].lock().get(local).unwrap_or(0.0))
    }

    /// Reads `indexes` (global, owned by `key`) from one partition.
    pub fn apply_get(&self, key: &PartitionKey, indexes: &[u64]) -> Result<Vec<f64>> {
        let pos = self.position(key)?;
        let locals = indexes
            .iter()
            .map(|&i| Self::local(key, i))
            .collect::<Result<Vec<_>>>()?;
        let vector = self.slots[pos].lock();
        Ok(locals
            .into_iter()
            .map(|l| vector.get(l).unwrap_or(0.0))
            .collect())
    }

    /// Adds `deltas[i]` to `indexes[i]` inside one partition.
    ///
    /// All indexes are checked before any delta is applied, so a rejected
    /// update leaves the partition untouched. Returns the number of applied
    /// deltas.
    pub fn apply_update(&self, key: &PartitionKey, indexes: &[u64], deltas: &[f64]) -> Result<usize> {
        if indexes.len() != deltas.len() {
            return Err(ShardError::InvalidRequest(format!(
                "{} indexes but {} deltas",
                indexes.len(),
                deltas.len()
            )));
        }
        let pos = self.position(key)?;
        let locals = indexes
            .iter()
            .map(|&i| Self::local(key, i))
            .collect::<Result<Vec<_>>>()?;
        let mut vector = self.slots[pos].lock();
        for (local, delta) in locals.into_iter().zip(deltas) {
            vector.plus_by(local, *delta)?;
        }
        Ok(indexes.len())
    }

    /// Returns the active `(global index, value)` entries of one partition
    /// that fall in `[start, end)`, ascending by index.
    pub fn apply_range(&self, key: &PartitionKey, start: u64, end: u64) -> Result<Vec<(u64, f64)>> {
        let pos = self.position(key)?;
        let start = start.max(key.start_col);
        let end = end.min(key.end_col);
        if start >= end {
            return Ok(Vec::new());
        }
        let vector = self.slots[pos].lock();
        let mut entries: Vec<(u64, f64)> = vector
            .iter_active()
            .map(|(local, v)| (key.start_col + local as u64, v))
            .filter(|(i, _)| *i >= start && *i < end)
            .collect();
        entries.sort_by_key(|(i, _)| *i);
        Ok(entries)
    }

    /// Runs `f` with exclusive access to one partition's storage.
    pub fn with_partition_mut<R>(
        &self,
        key: &PartitionKey,
        f: impl FnOnce(&mut PhysicalVector) -> R,
    ) -> Result<R> {
        let pos = self.position(key)?;
        let mut vector = self.slots[pos].lock();
        Ok(f(&mut vector))
    }

    /// Copies the current contents into a plain [`CompositeVector`].
    ///
    /// Partitions are locked one at a time: each partition is internally
    /// consistent, but concurrent writers may land between partitions.
    pub fn snapshot(&self) -> CompositeVector {
        let vectors = self.slots.iter().map(|slot| slot.lock().clone()).collect();
        CompositeVector::from_validated(
            self.matrix_id,
            self.row_id,
            self.dim,
            self.keys.clone(),
            vectors,
        )
    }

    /// Unwraps the locks without copying.
    pub fn into_inner(self) -> CompositeVector {
        let vectors = self.slots.into_iter().map(Mutex::into_inner).collect();
        CompositeVector::from_validated(self.matrix_id, self.row_id, self.dim, self.keys, vectors)
    }
}

impl From<CompositeVector> for ConcurrentCompositeVector {
    fn from(vector: CompositeVector) -> Self {
        let matrix_id = vector.matrix_id();
        let row_id = vector.row_id();
        let dim = vector.dim();
        let (keys, slots): (Vec<_>, Vec<_>) = vector
            .into_parts()
            .into_iter()
            .map(|(k, v)| (k, Mutex::new(v)))
            .unzip();
        let starts = keys.iter().map(|k| k.start_col).collect();
        Self {
            matrix_id,
            row_id,
            dim,
            keys,
            starts,
            slots,
        }
    }
}

impl CompositeVector {
    /// Moves this vector behind per-partition locks.
    pub fn into_concurrent(self) -> ConcurrentCompositeVector {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MatrixLayout;
    use crate::vector::StorageKind;
    use std::sync::Arc;
    use std::thread;

    fn shared(kind: StorageKind) -> ConcurrentCompositeVector {
        let layout = MatrixLayout::uniform(MatrixId::new(3), 1, 400, 1, 4).unwrap();
        CompositeVector::for_row(&layout, RowId::new(0), kind)
            .unwrap()
            .into_concurrent()
    }

    #[test]
    fn test_apply_update_and_get() {
        let v = shared(StorageKind::Sparse);
        let key = v.keys()[1];
        assert_eq!(v.apply_update(&key, &[100, 150], &[1.0, 2.5]).unwrap(), 2);
        assert_eq!(v.apply_get(&key, &[100, 150, 199]).unwrap(), vec![1.0, 2.5, 0.0]);
        assert_eq!(v.get(150).unwrap(), 2.5);
    }

    #[test]
    fn test_rejects_foreign_index_without_partial_apply() {
        let v = shared(StorageKind::Dense);
        let key = v.keys()[0];
        let err = v.apply_update(&key, &[5, 120], &[1.0, 1.0]).unwrap_err();
        assert_eq!(
            err,
            ShardError::OutOfRange {
                index: 120,
                lower: 0,
                upper: 100
            }
        );
        assert_eq!(v.get(5).unwrap(), 0.0);
    }

    #[test]
    fn test_unknown_partition() {
        let v = shared(StorageKind::Sparse);
        let mut key = v.keys()[0];
        key.end_col = 50;
        assert!(matches!(
            v.apply_get(&key, &[1]),
            Err(ShardError::PartitionUnavailable { .. })
        ));
    }

    #[test]
    fn test_apply_range_clamps() {
        let v = shared(StorageKind::SortedSparse);
        let key = v.keys()[2];
        v.apply_update(&key, &[210, 250, 290], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(
            v.apply_range(&key, 0, 260).unwrap(),
            vec![(210, 1.0), (250, 2.0)]
        );
        assert!(v.apply_range(&key, 300, 400).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writers_per_partition() {
        let v = Arc::new(shared(StorageKind::Sparse));
        let handles: Vec<_> = v
            .keys()
            .to_vec()
            .into_iter()
            .flat_map(|key| {
                (0..4).map(move |_| key)
            })
            .map(|key| {
                let v = Arc::clone(&v);
                thread::spawn(move || {
                    for _ in 0..250 {
                        v.apply_update(&key, &[key.start_col], &[1.0]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = v.snapshot();
        for key in snapshot.keys() {
            assert_eq!(snapshot.get(key.start_col).unwrap(), 1000.0);
        }
        assert_eq!(snapshot.sum(), 4000.0);
    }

    #[test]
    fn test_into_inner_keeps_contents() {
        let v = shared(StorageKind::Dense);
        let key = v.keys()[3];
        v.with_partition_mut(&key, |p| p.set(0, 9.0)).unwrap().unwrap();
        let plain = v.into_inner();
        assert_eq!(plain.get(300).unwrap(), 9.0);
    }
}
