//! Per-cycle lag buffers, the preview image and the live running totals.

use std::mem;

use ndarray::prelude::*;

use crate::{
    array::AntennaArray,
    geometry::SkyDirection,
    hardware::{CorrelationPacket, LagVector},
};

/// A growable `rows x width` buffer, one row appended per tick.
#[derive(Debug, Clone, PartialEq)]
pub struct LagBuffer {
    width: usize,
    data: Vec<f64>,
}

impl LagBuffer {
    pub fn new(width: usize) -> LagBuffer {
        LagBuffer {
            width,
            data: vec![],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append one row. A row of the wrong length is truncated or zero-padded
    /// so the buffer always holds whole rows; `false` is returned for it.
    pub fn push_row(&mut self, row: impl ExactSizeIterator<Item = f64>) -> bool {
        if self.width == 0 {
            return true;
        }
        let fits = row.len() == self.width;
        let start = self.data.len();
        self.data.extend(row.take(self.width));
        self.data.resize(start + self.width, 0.0);
        fits
    }

    /// Detach the contents, leaving this buffer empty for the next cycle.
    pub fn freeze(&mut self) -> Array2<f64> {
        let rows = self.rows();
        let data = mem::take(&mut self.data);
        Array2::from_shape_vec((rows, self.width), data)
            .unwrap_or_else(|_| Array2::zeros((0, self.width)))
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// A square (u,v)-plane accumulator for live feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewImage {
    /// \[height, width\]
    data: Array2<f64>,
}

impl PreviewImage {
    pub fn new(size: usize) -> PreviewImage {
        PreviewImage {
            data: Array2::zeros((size, size)),
        }
    }

    pub fn width(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn height(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn view(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    /// The pixel for a normalised `(u, v)`, if it lands inside the image.
    pub fn pixel(&self, u: f64, v: f64) -> Option<(usize, usize)> {
        let (w, h) = (self.width() as f64, self.height() as f64);
        let x = (w / 2.0).floor() + (w * u / 2.0).floor();
        let y = (h / 2.0).floor() + (h * v / 2.0).floor();
        if !(0.0..w).contains(&x) || !(0.0..h).contains(&y) {
            return None;
        }
        Some((x as usize, y as usize))
    }

    /// Add `value` at `(u, v)` and at the point-symmetric pixel.
    pub fn add(&mut self, u: f64, v: f64, value: f64) {
        let Some((x, y)) = self.pixel(u, v) else {
            return;
        };
        let (w, h) = (self.width(), self.height());
        self.data[[y, x]] += value;
        self.data[[h - 1 - y, w - 1 - x]] += value;
    }

    pub fn resize(&mut self, size: usize) {
        self.data = Array2::zeros((size, size));
    }

    pub fn freeze(&mut self) -> Array2<f64> {
        let dim = self.data.dim();
        mem::replace(&mut self.data, Array2::zeros(dim))
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }
}

/// Everything one integration cycle collected, detached from the live
/// accumulator.
#[derive(Debug, Clone)]
pub struct FrozenBuffers {
    /// One per line, `[rows, auto lags]`.
    pub autocorrelations: Vec<Array2<f64>>,

    /// One per baseline, `[rows, cross lags]`.
    pub crosscorrelations: Vec<Array2<f64>>,

    pub preview: Array2<f64>,
}

/// The per-cycle buffers. Only the packet reader writes to these.
#[derive(Debug, Clone)]
pub struct Accumulator {
    autocorrelations: Vec<LagBuffer>,
    crosscorrelations: Vec<LagBuffer>,
    preview: PreviewImage,
}

impl Accumulator {
    pub fn new(
        num_lines: usize,
        num_baselines: usize,
        auto_width: usize,
        cross_width: usize,
        plot_size: usize,
    ) -> Accumulator {
        Accumulator {
            autocorrelations: vec![LagBuffer::new(auto_width); num_lines],
            crosscorrelations: vec![LagBuffer::new(cross_width); num_baselines],
            preview: PreviewImage::new(plot_size),
        }
    }

    pub fn autocorrelations(&self) -> &[LagBuffer] {
        &self.autocorrelations
    }

    pub fn crosscorrelations(&self) -> &[LagBuffer] {
        &self.crosscorrelations
    }

    pub fn preview(&self) -> &PreviewImage {
        &self.preview
    }

    /// Fold one packet into the cycle: a row for every enabled line and
    /// baseline, plus the preview. Returns how many rows had to be padded or
    /// truncated to the buffer width.
    pub fn accumulate(
        &mut self,
        packet: &CorrelationPacket,
        array: &AntennaArray,
        direction: SkyDirection,
    ) -> usize {
        let mut misfits = 0;
        for line in array.enabled_lines() {
            if let (Some(buffer), Some(lags)) = (
                self.autocorrelations.get_mut(line.index),
                packet.autocorrelations.get(line.index),
            ) {
                misfits += usize::from(!buffer.push_row(lags.magnitudes()));
            }
        }

        for baseline in array.baselines() {
            if !array.baseline_enabled(baseline) {
                continue;
            }
            let Some(lags) = packet.crosscorrelations.get(baseline.index) else {
                continue;
            };
            if let Some(buffer) = self.crosscorrelations.get_mut(baseline.index) {
                misfits += usize::from(!buffer.push_row(lags.magnitudes()));
            }
            if let Some(value) = lags.normalized_center() {
                let (u, v) = baseline.geometry.uv(direction);
                self.preview.add(u, v, value);
            }
        }
        misfits
    }

    pub fn resize_preview(&mut self, size: usize) {
        if self.preview.width() != size || self.preview.height() != size {
            self.preview.resize(size);
        }
    }

    /// Swap out all buffers. The accumulator is empty afterwards.
    pub fn freeze(&mut self) -> FrozenBuffers {
        FrozenBuffers {
            autocorrelations: self.autocorrelations.iter_mut().map(LagBuffer::freeze).collect(),
            crosscorrelations: self
                .crosscorrelations
                .iter_mut()
                .map(LagBuffer::freeze)
                .collect(),
            preview: self.preview.freeze(),
        }
    }

    /// Throw away everything collected so far.
    pub fn clear(&mut self) {
        self.autocorrelations.iter_mut().for_each(LagBuffer::clear);
        self.crosscorrelations.iter_mut().for_each(LagBuffer::clear);
        self.preview.clear();
    }
}

/// Running zero-lag sums for one baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrelationTotal {
    pub magnitude: f64,
    pub counts: f64,
    pub phase: f64,
}

/// Totals for live statistics, reset every reporting tick whatever the
/// integration state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningTotals {
    pub counts: Vec<f64>,
    pub correlations: Vec<CorrelationTotal>,
}

impl RunningTotals {
    pub fn new(num_lines: usize, num_baselines: usize) -> RunningTotals {
        RunningTotals {
            counts: vec![0.0; num_lines],
            correlations: vec![CorrelationTotal::default(); num_baselines],
        }
    }

    pub fn add(&mut self, packet: &CorrelationPacket, array: &AntennaArray) {
        for line in array.enabled_lines() {
            if let (Some(total), Some(&counts)) =
                (self.counts.get_mut(line.index), packet.counts.get(line.index))
            {
                *total += counts as f64;
            }
        }
        for baseline in array.baselines() {
            if !array.baseline_enabled(baseline) {
                continue;
            }
            let center = packet
                .crosscorrelations
                .get(baseline.index)
                .and_then(LagVector::center);
            if let (Some(total), Some(center)) =
                (self.correlations.get_mut(baseline.index), center)
            {
                total.magnitude += center.magnitude;
                total.counts += center.counts as f64;
                total.phase += center.phase;
            }
        }
    }

    /// Hand back the totals and start again from zero.
    pub fn take(&mut self) -> RunningTotals {
        let fresh = RunningTotals::new(self.counts.len(), self.correlations.len());
        mem::replace(self, fresh)
    }
}
