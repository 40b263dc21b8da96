//! Per-line delay-line settings for a sky direction.

use log::trace;
use marlu::{constants::VEL_C, ENH};

use crate::geometry::{BaselineGeometry, SkyDirection};

/// One line's delay for the current tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelDelay {
    pub line: usize,

    /// Geometric delay relative to the reference line \[seconds\].
    pub delay_s: f64,

    /// What gets programmed into the delay line \[clock ticks\].
    pub ticks: u32,
}

/// The result of one compensation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayMap {
    /// The line every other line is delayed against. Its delay is pinned to
    /// zero.
    pub reference: usize,

    /// One entry per enabled line, in line order, the reference included.
    pub channels: Vec<ChannelDelay>,
}

impl DelayMap {
    pub fn get(&self, line: usize) -> Option<&ChannelDelay> {
        self.channels.iter().find(|c| c.line == line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayCompensator {
    /// \[Hz\]
    pub clock_frequency: f64,
    pub delayline_depth: u32,
}

impl DelayCompensator {
    pub fn new(clock_frequency: f64, delayline_depth: u32) -> DelayCompensator {
        DelayCompensator {
            clock_frequency,
            delayline_depth,
        }
    }

    /// Convert a path difference \[metres\] into delay-line ticks, clamped to
    /// the depth of the line.
    pub fn to_ticks(&self, path_m: f64) -> u32 {
        let max = self.delayline_depth.saturating_sub(1);
        let ticks = (path_m.abs() * self.clock_frequency / VEL_C).floor();
        if ticks.is_nan() || ticks <= 0.0 {
            0
        } else if ticks >= max as f64 {
            max
        } else {
            ticks as u32
        }
    }

    /// Pick the reference line and compute every enabled line's delay.
    ///
    /// Returns `None` when fewer than two lines are enabled, or when every
    /// enabled line sits on the array centre so no reference can be chosen.
    pub fn compute(
        &self,
        positions: &[ENH],
        enabled: &[bool],
        direction: SkyDirection,
    ) -> Option<DelayMap> {
        let active: Vec<usize> = (0..positions.len())
            .filter(|&i| enabled.get(i).copied().unwrap_or(false))
            .collect();
        if active.len() < 2 {
            return None;
        }

        let count = active.len() as f64;
        let mean = |axis: fn(&ENH) -> f64| {
            active.iter().map(|&i| axis(&positions[i])).sum::<f64>() / count
        };
        let centre = ENH {
            e: mean(|p| p.e),
            n: mean(|p| p.n),
            h: mean(|p| p.h),
        };

        // The line furthest along the direction, per unit distance from the
        // centre, leads; ties go to the lowest index.
        let mut reference: Option<(usize, f64)> = None;
        for &i in &active {
            let relative = BaselineGeometry::between(centre, positions[i]);
            let distance = relative.length();
            if distance <= f64::EPSILON {
                continue;
            }
            let ratio = relative.delay(direction) / distance;
            if reference.map_or(true, |(_, best)| ratio > best) {
                reference = Some((i, ratio));
            }
        }
        let (reference, _) = reference?;

        let channels = active
            .iter()
            .map(|&line| {
                if line == reference {
                    return ChannelDelay {
                        line,
                        delay_s: 0.0,
                        ticks: 0,
                    };
                }
                let path_m = BaselineGeometry::between(positions[reference], positions[line])
                    .delay(direction)
                    .abs();
                ChannelDelay {
                    line,
                    delay_s: path_m / VEL_C,
                    ticks: self.to_ticks(path_m),
                }
            })
            .collect();

        let map = DelayMap {
            reference,
            channels,
        };
        trace!("Delay map: {map:?}");
        Some(map)
    }
}
