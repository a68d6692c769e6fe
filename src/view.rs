//! The matrix of record and its projections.
//!
//! `OtdMatrix` is owned by the engine. Every projection is a fresh allocation, so no caller
//! can mutate the matrix of record through a view.

use crate::Result;
use ndarray::Array2;
use std::io;

/// Pairwise distance matrix with row (source) and column (target) provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct OtdMatrix {
    values: Array2<f32>,
    row_labels: Vec<String>,
    col_labels: Vec<String>,
}

impl OtdMatrix {
    pub(crate) fn new(values: Array2<f32>, row_labels: Vec<String>, col_labels: Vec<String>) -> Self {
        debug_assert_eq!(values.nrows(), row_labels.len());
        debug_assert_eq!(values.ncols(), col_labels.len());
        Self {
            values,
            row_labels,
            col_labels,
        }
    }

    /// `(|sources|, |targets|)`.
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f32> {
        self.values.get((i, j)).copied()
    }

    pub fn row_labels(&self) -> &[String] {
        &self.row_labels
    }

    pub fn col_labels(&self) -> &[String] {
        &self.col_labels
    }

    pub fn view(&self) -> ResultView<'_> {
        ResultView { matrix: self }
    }
}

/// Read-only projections of an `OtdMatrix`.
#[derive(Debug, Clone, Copy)]
pub struct ResultView<'a> {
    matrix: &'a OtdMatrix,
}

impl<'a> ResultView<'a> {
    /// Owned `ndarray` copy.
    pub fn as_matrix(&self) -> Array2<f32> {
        self.matrix.values.to_owned()
    }

    /// Plain nested rows, row-major.
    pub fn as_rows(&self) -> Vec<Vec<f32>> {
        self.matrix
            .values
            .rows()
            .into_iter()
            .map(|r| r.to_vec())
            .collect()
    }

    pub fn as_labeled_table(&self) -> LabeledTable {
        LabeledTable {
            row_labels: self.matrix.row_labels.clone(),
            col_labels: self.matrix.col_labels.clone(),
            values: self.matrix.values.to_owned(),
        }
    }

    /// Native tensor on the accelerated backend's host twin.
    #[cfg(feature = "burn")]
    pub fn as_tensor(
        &self,
    ) -> burn_core::tensor::Tensor<crate::burn_kernel::AccelInner, 2> {
        use burn_core::tensor::backend::Backend;
        let device = <crate::burn_kernel::AccelInner as Backend>::Device::default();
        crate::burn_kernel::array_to_tensor(&self.matrix.values.view(), &device)
    }
}

/// A matrix with row and column identifiers (the "data frame" form).
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledTable {
    row_labels: Vec<String>,
    col_labels: Vec<String>,
    values: Array2<f32>,
}

impl LabeledTable {
    pub(crate) fn new(values: Array2<f32>, row_labels: Vec<String>, col_labels: Vec<String>) -> Self {
        debug_assert_eq!(values.nrows(), row_labels.len());
        debug_assert_eq!(values.ncols(), col_labels.len());
        Self {
            row_labels,
            col_labels,
            values,
        }
    }

    pub fn row_labels(&self) -> &[String] {
        &self.row_labels
    }

    pub fn col_labels(&self) -> &[String] {
        &self.col_labels
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    /// Look up a cell by labels (first match on duplicates).
    pub fn get(&self, row: &str, col: &str) -> Option<f32> {
        let i = self.row_labels.iter().position(|l| l == row)?;
        let j = self.col_labels.iter().position(|l| l == col)?;
        Some(self.values[[i, j]])
    }

    /// CSV with a header row of column labels and the row label as the first field.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = Vec::with_capacity(self.col_labels.len() + 1);
        header.push(String::new());
        header.extend(self.col_labels.iter().cloned());
        wtr.write_record(&header)?;
        for (label, row) in self.row_labels.iter().zip(self.values.rows()) {
            let mut rec = Vec::with_capacity(row.len() + 1);
            rec.push(label.clone());
            rec.extend(row.iter().map(|v| v.to_string()));
            wtr.write_record(&rec)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl core::fmt::Display for LabeledTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let w0 = self.row_labels.iter().map(String::len).max().unwrap_or(0);
        let w = self
            .col_labels
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max(10);
        write!(f, "{:w0$}", "")?;
        for c in &self.col_labels {
            write!(f, " {c:>w$}")?;
        }
        writeln!(f)?;
        for (label, row) in self.row_labels.iter().zip(self.values.rows()) {
            write!(f, "{label:w0$}")?;
            for v in row {
                write!(f, " {v:>w$.6}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> OtdMatrix {
        OtdMatrix::new(
            array![[0.0f32, 1.5, 2.0], [3.0, 0.25, 4.0]],
            vec!["A".into(), "B".into()],
            vec!["X".into(), "Y".into(), "Z".into()],
        )
    }

    #[test]
    fn projections_agree_and_preserve_order() {
        let m = sample();
        let v = m.view();
        let arr = v.as_matrix();
        let rows = v.as_rows();
        let table = v.as_labeled_table();
        assert_eq!(rows, vec![vec![0.0, 1.5, 2.0], vec![3.0, 0.25, 4.0]]);
        assert_eq!(table.row_labels(), &["A", "B"]);
        assert_eq!(table.col_labels(), &["X", "Y", "Z"]);
        for i in 0..2 {
            for j in 0..3 {
                assert_eq!(arr[[i, j]], rows[i][j]);
                assert_eq!(table.values()[[i, j]], rows[i][j]);
            }
        }
        assert_eq!(table.get("B", "Y"), Some(0.25));
        assert_eq!(table.get("C", "Y"), None);
    }

    #[test]
    fn projections_do_not_alias_the_record() {
        let m = sample();
        let mut arr = m.view().as_matrix();
        arr[[0, 0]] = 99.0;
        assert_eq!(m.get(0, 0), Some(0.0));
    }

    #[test]
    fn csv_has_labeled_header_and_rows() -> Result<()> {
        let csv = sample().view().as_labeled_table().to_csv_string()?;
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], ",X,Y,Z");
        assert_eq!(lines[1], "A,0,1.5,2");
        assert_eq!(lines[2], "B,3,0.25,4");
        Ok(())
    }

    #[test]
    fn display_lists_labels_in_order() {
        let s = sample().view().as_labeled_table().to_string();
        let first = s.lines().next().unwrap();
        let (x, y, z) = (first.find('X'), first.find('Y'), first.find('Z'));
        assert!(x < y && y < z);
        assert!(s.lines().nth(1).unwrap().starts_with('A'));
    }
}
