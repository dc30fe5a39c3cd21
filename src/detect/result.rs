//! Raw detector output records.
//!
//! The detector emits a `[1, 1, N, 7]` array; each row is
//! `(batch_index, label, confidence, xmin, ymin, xmax, ymax)` with box
//! coordinates normalized to `[0, 1]`. N is fixed by the model and padded
//! with low-confidence rows.

use anyhow::{anyhow, Result};
use ndarray::ArrayView4;

/// Values per detection row.
pub const RECORD_LEN: usize = 7;

/// One raw detection row, still in normalized coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawDetection {
    pub batch_index: u32,
    pub label: u32,
    pub confidence: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl RawDetection {
    pub fn new(label: u32, confidence: f32, xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            batch_index: 0,
            label,
            confidence,
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    fn from_row(row: &[f32]) -> Self {
        Self {
            batch_index: float_to_index(row[0]),
            label: float_to_index(row[1]),
            confidence: row[2],
            xmin: row[3],
            ymin: row[4],
            xmax: row[5],
            ymax: row[6],
        }
    }
}

fn float_to_index(value: f32) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round() as u32
    } else {
        0
    }
}

/// Parse a flat `[1, 1, N, 7]` output buffer.
///
/// Any other shape is a configuration error: the loaded model does not
/// follow the detection-output contract.
pub fn parse_output(shape: &[usize], values: &[f32]) -> Result<Vec<RawDetection>> {
    let rows = match shape {
        [1, 1, n, RECORD_LEN] => *n,
        _ => {
            return Err(anyhow!(
                "detector output shape {:?} does not match [1, 1, N, {}]",
                shape,
                RECORD_LEN
            ))
        }
    };
    if values.len() != rows * RECORD_LEN {
        return Err(anyhow!(
            "detector output holds {} values, shape {:?} needs {}",
            values.len(),
            shape,
            rows * RECORD_LEN
        ));
    }
    Ok(values
        .chunks_exact(RECORD_LEN)
        .map(RawDetection::from_row)
        .collect())
}

/// Parse an output already viewed as a 4-D array.
pub fn parse_array(output: ArrayView4<'_, f32>) -> Result<Vec<RawDetection>> {
    let shape = output.shape().to_vec();
    let values: Vec<f32> = output.iter().copied().collect();
    parse_output(&shape, &values)
}
