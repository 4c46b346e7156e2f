use super::{expect_inputs, Function};
use crate::tensor::{Tensor, TensorError};

/// Selects rows of a `[rows, cols]` table.
///
/// With a single squeezed index the output is the 1-D row itself; otherwise
/// it is a `[indices.len(), cols]` matrix. The gradient scatters each output
/// row back onto the table row it came from, accumulating repeats.
#[derive(Debug, Clone)]
pub struct Gather {
    indices: Vec<usize>,
    squeeze: bool,
}

impl Gather {
    /// Gathers several rows into a matrix.
    #[must_use]
    pub fn rows(indices: Vec<usize>) -> Box<dyn Function> {
        Box::new(Self {
            indices,
            squeeze: false,
        })
    }

    /// Gathers one row as a 1-D tensor.
    #[must_use]
    pub fn row(index: usize) -> Box<dyn Function> {
        Box::new(Self {
            indices: vec![index],
            squeeze: true,
        })
    }

    fn table_dims(table: &Tensor) -> Result<(usize, usize), TensorError> {
        match table.shape() {
            &[rows, cols] => Ok((rows, cols)),
            other => Err(TensorError::ShapeMismatch {
                op: "Gather",
                details: format!("expected a 2-D table, got {other:?}"),
            }),
        }
    }
}

impl Function for Gather {
    fn name(&self) -> &'static str {
        "Gather"
    }

    fn run(&self, inps: &[&Tensor]) -> Result<Tensor, TensorError> {
        expect_inputs(inps, 1, "Gather")?;
        let table = inps[0];
        let (rows, cols) = Self::table_dims(table)?;
        let mut data = Vec::with_capacity(self.indices.len() * cols);
        for &index in &self.indices {
            if index >= rows {
                return Err(TensorError::IndexOutOfRange { index, len: rows });
            }
            data.extend_from_slice(&table.blob()[index * cols..(index + 1) * cols]);
        }
        if self.squeeze {
            Ok(Tensor::vector(data))
        } else {
            Tensor::raw(&[self.indices.len(), cols], data)
        }
    }

    fn grad(&self, inps: &[&Tensor], out_grad: &Tensor) -> Result<Vec<Tensor>, TensorError> {
        expect_inputs(inps, 1, "Gather::grad")?;
        let (rows, cols) = Self::table_dims(inps[0])?;
        if out_grad.size() != self.indices.len() * cols {
            return Err(TensorError::ShapeMismatch {
                op: "Gather::grad",
                details: format!(
                    "gradient {:?} does not cover {} rows of width {cols}",
                    out_grad.shape(),
                    self.indices.len()
                ),
            });
        }
        let mut data = vec![0.0; rows * cols];
        if cols > 0 {
            for (&index, g_row) in self.indices.iter().zip(out_grad.blob().chunks(cols)) {
                if index >= rows {
                    return Err(TensorError::IndexOutOfRange { index, len: rows });
                }
                for (acc, &g) in data[index * cols..(index + 1) * cols].iter_mut().zip(g_row) {
                    *acc += g;
                }
            }
        }
        Ok(vec![Tensor::raw(&[rows, cols], data)?])
    }
}
