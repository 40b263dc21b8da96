//! Baseline geometry and sky directions.
//!
//! Line positions are [`ENH`] offsets from an arbitrary array origin
//! \[metres\]. Baselines are projected with [`UVW::from_xyz`] against the
//! target's hour angle and declination, so `w` is the geometric path
//! difference and `(u, v)` the projection onto the plane of the sky.

use hifitime::{Duration, Epoch};
use marlu::{precession::precess_time, LatLngHeight, RADec, ENH, HADec, UVW};

/// Where the array is looking: the target's hour angle and declination, and
/// the latitude they are seen from \[radians\].
#[derive(Debug, Clone, Copy)]
pub struct SkyDirection {
    pub hadec: HADec,
    pub latitude_rad: f64,
}

impl SkyDirection {
    pub fn new(hadec: HADec, latitude_rad: f64) -> SkyDirection {
        SkyDirection {
            hadec,
            latitude_rad,
        }
    }

    /// The direction of `radec` from `site` at local sidereal time `lst_rad`.
    pub fn from_radec(radec: RADec, site: LatLngHeight, lst_rad: f64) -> SkyDirection {
        SkyDirection::new(radec.to_hadec(lst_rad), site.latitude_rad)
    }

    /// The direction of `radec` as seen from `site` at `time`. The sidereal
    /// time is recomputed every call, so calling this on every packet tracks
    /// the target across the sky.
    pub fn at_epoch(
        radec: RADec,
        site: LatLngHeight,
        time: Epoch,
        dut1: Duration,
    ) -> SkyDirection {
        let precession = precess_time(site.longitude_rad, site.latitude_rad, radec, time, dut1);
        SkyDirection::from_radec(radec, site, precession.lmst)
    }
}

/// The vector between two lines, as an east/north/height offset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BaselineGeometry {
    pub vector: ENH,
}

impl BaselineGeometry {
    pub fn new(vector: ENH) -> BaselineGeometry {
        BaselineGeometry { vector }
    }

    /// The baseline from `first` to `second` (i.e. `second - first`).
    pub fn between(first: ENH, second: ENH) -> BaselineGeometry {
        BaselineGeometry::new(ENH {
            e: second.e - first.e,
            n: second.n - first.n,
            h: second.h - first.h,
        })
    }

    pub fn length(&self) -> f64 {
        let ENH { e, n, h } = self.vector;
        (e * e + n * n + h * h).sqrt()
    }

    fn uvw(&self, direction: SkyDirection) -> UVW {
        UVW::from_xyz(self.vector.to_xyz(direction.latitude_rad), direction.hadec)
    }

    /// The geometric path difference along `direction` \[metres\]. Divide by
    /// the speed of light for seconds.
    pub fn delay(&self, direction: SkyDirection) -> f64 {
        self.uvw(direction).w
    }

    /// The projection of the baseline onto the plane of the sky, normalised
    /// by the baseline length so that `u² + v² <= 1`. A zero-length baseline
    /// projects to the origin.
    pub fn uv(&self, direction: SkyDirection) -> (f64, f64) {
        let length = self.length();
        if length <= f64::EPSILON {
            return (0.0, 0.0);
        }
        let UVW { u, v, .. } = self.uvw(direction);
        (u / length, v / length)
    }
}
