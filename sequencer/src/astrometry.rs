//! Sky coordinate helpers for acquisition
//!
//! All angles are degrees unless the name says otherwise.

use kestrel_protocol::peer::WcsSolution;

/// Sky position in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

/// On-sky offset in arcseconds, RA component already scaled by cos(dec)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SkyOffset {
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

impl SkyOffset {
    pub fn magnitude(&self) -> f64 {
        self.ra_arcsec.hypot(self.dec_arcsec)
    }
}

impl std::ops::AddAssign for SkyOffset {
    fn add_assign(&mut self, rhs: Self) {
        self.ra_arcsec += rhs.ra_arcsec;
        self.dec_arcsec += rhs.dec_arcsec;
    }
}

/// Wrap an RA difference into -180..=180 degrees
pub fn normalize_ra_diff_deg(diff: f64) -> f64 {
    let mut wrapped = diff % 360.0;
    if wrapped > 180.0 {
        wrapped -= 360.0;
    } else if wrapped < -180.0 {
        wrapped += 360.0;
    }
    wrapped
}

/// Sky position seen at FITS pixel (`x`, `y`) under a gnomonic solution
pub fn pixel_to_sky(wcs: &WcsSolution, x: f64, y: f64) -> SkyPosition {
    let dx = x - wcs.crpix1;
    let dy = y - wcs.crpix2;
    let xi = (wcs.cd1_1 * dx + wcs.cd1_2 * dy).to_radians();
    let eta = (wcs.cd2_1 * dx + wcs.cd2_2 * dy).to_radians();

    let ra0 = wcs.crval1_deg.to_radians();
    let dec0 = wcs.crval2_deg.to_radians();

    let denom = dec0.cos() - eta * dec0.sin();
    let ra = ra0 + xi.atan2(denom);
    let dec = (dec0.sin() + eta * dec0.cos()).atan2(xi.hypot(denom));

    SkyPosition {
        ra_deg: ra.to_degrees().rem_euclid(360.0),
        dec_deg: dec.to_degrees(),
    }
}

/// Offset that moves `from` onto `to`
pub fn sky_offset(from: SkyPosition, to: SkyPosition) -> SkyOffset {
    let dra = normalize_ra_diff_deg(to.ra_deg - from.ra_deg);
    let ddec = to.dec_deg - from.dec_deg;
    SkyOffset {
        ra_arcsec: dra * to.dec_deg.to_radians().cos() * 3600.0,
        dec_arcsec: ddec * 3600.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn simple_wcs(ra: f64, dec: f64) -> WcsSolution {
        // 1"/pixel, RA increasing to the left
        WcsSolution {
            crval1_deg: ra,
            crval2_deg: dec,
            crpix1: 512.0,
            crpix2: 512.0,
            cd1_1: -1.0 / 3600.0,
            cd1_2: 0.0,
            cd2_1: 0.0,
            cd2_2: 1.0 / 3600.0,
        }
    }

    #[test]
    fn test_reference_pixel_maps_to_reference_value() {
        let wcs = simple_wcs(150.0, 30.0);
        let sky = pixel_to_sky(&wcs, 512.0, 512.0);
        assert_abs_diff_eq!(sky.ra_deg, 150.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sky.dec_deg, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pixel_offset_near_reference_is_linear() {
        let wcs = simple_wcs(150.0, 0.0);
        let sky = pixel_to_sky(&wcs, 512.0, 522.0);
        assert_abs_diff_eq!(sky.dec_deg * 3600.0, 10.0, epsilon = 1e-4);

        let sky = pixel_to_sky(&wcs, 502.0, 512.0);
        assert_abs_diff_eq!((sky.ra_deg - 150.0) * 3600.0, 10.0, epsilon = 1e-4);
    }

    #[test]
    fn test_ra_wraps_across_zero() {
        let from = SkyPosition { ra_deg: 359.999, dec_deg: 0.0 };
        let to = SkyPosition { ra_deg: 0.001, dec_deg: 0.0 };
        let offset = sky_offset(from, to);
        assert_abs_diff_eq!(offset.ra_arcsec, 7.2, epsilon = 1e-6);

        assert_abs_diff_eq!(normalize_ra_diff_deg(350.0), -10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_ra_diff_deg(-350.0), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ra_offset_scales_with_cos_dec() {
        let from = SkyPosition { ra_deg: 10.0, dec_deg: 60.0 };
        let to = SkyPosition { ra_deg: 10.01, dec_deg: 60.0 };
        let offset = sky_offset(from, to);
        assert_abs_diff_eq!(offset.ra_arcsec, 36.0 * 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(offset.dec_arcsec, 0.0, epsilon = 1e-9);
    }
}
