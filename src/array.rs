//! The antenna (line) and baseline tables.
//!
//! Both tables are sized once, when the hardware reports its line count at
//! connect time, and are addressed by index from then on.

use itertools::Itertools;
use marlu::ENH;
use vec1::Vec1;

use crate::{config::LineFlags, geometry::BaselineGeometry};

/// One hardware channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Antenna {
    pub index: usize,

    /// Offset from the array origin \[metres\].
    pub position: ENH,

    pub flags: LineFlags,

    /// The geometric delay currently compensated on this line \[seconds\].
    pub delay_s: f64,
}

impl Antenna {
    pub fn is_enabled(&self) -> bool {
        self.flags.enabled
    }
}

/// An unordered pair of lines `first < second`.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub index: usize,
    pub first: usize,
    pub second: usize,

    /// `position[second] - position[first]`.
    pub geometry: BaselineGeometry,

    /// Observing wavelength \[metres\].
    pub wavelength: f64,

    /// Filter bandwidth, expressed as a wavelength \[metres\].
    pub bandwidth: f64,
}

#[derive(Debug, Clone)]
pub struct AntennaArray {
    lines: Vec1<Antenna>,
    baselines: Vec<Baseline>,
}

impl AntennaArray {
    /// Build the tables for `num_lines` lines, all disabled and sitting at the
    /// origin.
    pub fn new(num_lines: usize, wavelength: f64, bandwidth: f64) -> Option<AntennaArray> {
        let lines = (0..num_lines)
            .map(|index| Antenna {
                index,
                position: ENH::default(),
                flags: LineFlags::default(),
                delay_s: 0.0,
            })
            .collect::<Vec<_>>();
        let lines = Vec1::try_from_vec(lines).ok()?;
        let baselines = (0..num_lines)
            .tuple_combinations()
            .enumerate()
            .map(|(index, (first, second))| Baseline {
                index,
                first,
                second,
                geometry: BaselineGeometry::default(),
                wavelength,
                bandwidth,
            })
            .collect();
        Some(AntennaArray { lines, baselines })
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn num_baselines(&self) -> usize {
        self.baselines.len()
    }

    pub fn lines(&self) -> &[Antenna] {
        &self.lines
    }

    pub fn line(&self, index: usize) -> Option<&Antenna> {
        self.lines.get(index)
    }

    pub fn line_mut(&mut self, index: usize) -> Option<&mut Antenna> {
        self.lines.get_mut(index)
    }

    pub fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    /// Index of the baseline between lines `a` and `b`, in either order.
    pub fn baseline_index(&self, a: usize, b: usize) -> Option<usize> {
        let n = self.num_lines();
        let (i, j) = if a < b { (a, b) } else { (b, a) };
        if i == j || j >= n {
            return None;
        }
        // Row-major over the upper triangle.
        Some(i * (2 * n - i - 1) / 2 + (j - i - 1))
    }

    /// A baseline takes part in compensation, preview and totals only if
    /// both of its lines are enabled.
    pub fn baseline_enabled(&self, baseline: &Baseline) -> bool {
        self.lines[baseline.first].is_enabled() && self.lines[baseline.second].is_enabled()
    }

    pub fn enabled_lines(&self) -> impl Iterator<Item = &Antenna> {
        self.lines.iter().filter(|l| l.is_enabled())
    }

    pub fn positions(&self) -> Vec<ENH> {
        self.lines.iter().map(|l| l.position).collect()
    }

    pub fn enabled_mask(&self) -> Vec<bool> {
        self.lines.iter().map(|l| l.is_enabled()).collect()
    }

    /// Move a line and refresh every baseline that touches it.
    pub fn set_position(&mut self, line: usize, position: ENH) {
        let Some(antenna) = self.lines.get_mut(line) else {
            return;
        };
        antenna.position = position;
        for baseline in self
            .baselines
            .iter_mut()
            .filter(|b| b.first == line || b.second == line)
        {
            baseline.geometry = BaselineGeometry::between(
                self.lines[baseline.first].position,
                self.lines[baseline.second].position,
            );
        }
    }

    pub fn set_flags(&mut self, line: usize, flags: LineFlags) {
        if let Some(antenna) = self.lines.get_mut(line) {
            antenna.flags = flags;
        }
    }

    pub fn set_band(&mut self, wavelength: f64, bandwidth: f64) {
        for baseline in &mut self.baselines {
            baseline.wavelength = wavelength;
            baseline.bandwidth = bandwidth;
        }
    }
}
