use engine::{Tensor, Value};
use rand::Rng;
use rand::seq::SliceRandom;

/// One named tensor's rows within a shard (row-major, fixed width).
#[derive(Debug, Clone)]
pub struct Column {
    width: usize,
    data: Vec<f32>,
}

impl Column {
    /// # Panics
    /// - if `width` is zero
    /// - if `data.len()` is not a multiple of `width`
    pub fn new(width: usize, data: Vec<f32>) -> Self {
        assert!(width > 0, "column width must be > 0");
        assert_eq!(
            data.len() % width,
            0,
            "column data must be a whole number of rows"
        );
        Self { width, data }
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.data.len() / self.width
    }

    fn rows(&self, start: usize, end: usize) -> Tensor {
        let slice = &self.data[start * self.width..end * self.width];
        Tensor::new(vec![end - start, self.width], slice.to_vec())
    }

    fn permute(&mut self, order: &[usize]) {
        let mut data = Vec::with_capacity(self.data.len());
        for &row in order {
            data.extend_from_slice(&self.data[row * self.width..(row + 1) * self.width]);
        }
        self.data = data;
    }
}

/// One shard of training data: aligned columns over the same samples.
#[derive(Debug, Clone)]
pub struct Shard {
    num_samples: usize,
    columns: Vec<Column>,
}

impl Shard {
    /// # Panics
    /// - if `columns` is empty or the shard has no samples
    /// - if the columns disagree on the sample count
    pub fn new(columns: Vec<Column>) -> Self {
        assert!(!columns.is_empty(), "shard must have at least one column");
        let num_samples = columns[0].num_rows();
        assert!(num_samples > 0, "shard must be non-empty");
        for column in &columns {
            assert_eq!(
                column.num_rows(),
                num_samples,
                "columns must cover the same samples"
            );
        }
        Self {
            num_samples,
            columns,
        }
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Batches per epoch over this shard, counting a partial tail batch.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        assert!(batch_size > 0, "batch_size must be > 0");
        self.num_samples.div_ceil(batch_size)
    }

    /// Returns the `index`-th batch, one tensor per column.
    ///
    /// # Panics
    /// - if `index` is out of range for `batch_size`
    pub fn batch(&self, batch_size: usize, index: usize) -> Vec<Value> {
        assert!(index < self.num_batches(batch_size), "batch out of range");
        let start = index * batch_size;
        let end = (start + batch_size).min(self.num_samples);
        self.columns
            .iter()
            .map(|column| Value::Tensor(column.rows(start, end)))
            .collect()
    }

    /// Permutes the samples in place, keeping columns aligned.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.num_samples).collect();
        order.shuffle(rng);
        for column in &mut self.columns {
            column.permute(&order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn shard() -> Shard {
        Shard::new(vec![
            Column::new(2, (0..10).map(|i| i as f32).collect()),
            Column::new(1, (100..105).map(|i| i as f32).collect()),
        ])
    }

    #[test]
    fn batches_respect_size_and_tail() {
        let s = shard();
        assert_eq!(s.num_samples(), 5);
        assert_eq!(s.num_batches(2), 3);

        let b0 = s.batch(2, 0);
        let xs = b0[0].as_tensor().unwrap();
        assert_eq!(xs.shape(), &[2, 2]);
        assert_eq!(xs.data(), &[0.0, 1.0, 2.0, 3.0]);

        let tail = s.batch(2, 2);
        assert_eq!(tail[0].as_tensor().unwrap().shape(), &[1, 2]);
        assert_eq!(tail[1].as_tensor().unwrap().data(), &[104.0]);
    }

    #[test]
    fn shuffle_keeps_columns_aligned() {
        let mut s = shard();
        let mut rng = StdRng::seed_from_u64(7);
        s.shuffle(&mut rng);

        for i in 0..5 {
            let b = s.batch(1, i);
            let x = b[0].as_tensor().unwrap().data()[0];
            let y = b[1].as_tensor().unwrap().data()[0];
            // Row k carries xs [2k, 2k+1] and label 100 + k.
            assert_eq!(y - 100.0, x / 2.0);
        }
    }

    #[test]
    #[should_panic]
    fn rejects_misaligned_columns() {
        let _ = Shard::new(vec![
            Column::new(2, vec![0.0; 10]),
            Column::new(1, vec![0.0; 4]),
        ]);
    }
}
