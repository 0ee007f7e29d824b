//! Acoustic propagation medium
//!
//! Speed of sound from Cramer's formula and per-band atmospheric
//! absorption from the ISO 9613-1 model, both parameterised by
//! temperature, static pressure and relative humidity.

use crate::bands::{BandResponse, FrequencyBands};

/// The medium sound travels through: a speed of sound and a per-band
/// absorption coefficient in dB per meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Medium {
    speed: f32,
    absorption: BandResponse,
}

impl Default for Medium {
    /// Air at 20 °C, 101.325 kPa, 50 % relative humidity with the default
    /// band layout.
    fn default() -> Self {
        Self::air(20.0, 101.325, 50.0, &FrequencyBands::default())
    }
}

impl Medium {
    /// A medium with an explicit speed of sound (m/s, clamped to ≥ 0) and
    /// per-band absorption (dB/m).
    pub fn new(speed: f32, absorption: BandResponse) -> Self {
        Self {
            speed: speed.max(0.0),
            absorption,
        }
    }

    /// Air at the given temperature (°C), static pressure (kPa) and
    /// relative humidity (%). Inputs outside the physical domain are
    /// clamped.
    pub fn air(temp_c: f32, pressure_kpa: f32, humidity: f32, bands: &FrequencyBands) -> Self {
        Self {
            speed: air_speed_of_sound(temp_c, pressure_kpa, humidity),
            absorption: air_absorption(temp_c, pressure_kpa, humidity, bands),
        }
    }

    /// Speed of sound in m/s.
    #[inline]
    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed.max(0.0);
    }

    /// Absorption in dB/m per band.
    #[inline]
    pub fn absorption(&self) -> &BandResponse {
        &self.absorption
    }

    pub fn set_absorption(&mut self, absorption: BandResponse) {
        self.absorption = absorption;
    }

    /// Linear air-absorption attenuation over a path of length `distance`
    /// meters: `10^(-α·d / 10)` per band.
    pub fn attenuation(&self, distance: f32) -> BandResponse {
        let db = self.absorption * distance;
        let mut result = BandResponse::zero();
        for b in 0..result.band_count() {
            result[b] = db_to_linear(-db[b]);
        }
        result
    }
}

/// Converts intensity decibels to a linear gain.
#[inline]
fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 10.0)
}

/// Speed of sound in humid air by Cramer's formula.
///
/// Valid for the clamped domain T ∈ [-273.15, ∞) °C, P ∈ [0, 10 000] kPa,
/// RH ∈ [0, 100] %.
pub fn air_speed_of_sound(temp_c: f32, pressure_kpa: f32, humidity: f32) -> f32 {
    let t = temp_c.clamp(-273.15, 100_000.0);
    let p = 1000.0 * pressure_kpa.clamp(0.0, 10_000.0);
    let rh = humidity.clamp(0.0, 100.0);

    let t_kel = 273.15 + t;

    // Saturation vapor pressure and enhancement factor.
    let enh = 3.141_593e-8 * p + 1.000_62 + t * t * 5.6e-7;
    let psv1 = t_kel * t_kel * 1.237_884_7e-5 - 1.912_131_6e-2 * t_kel;
    let psv2 = 33.937_110_47 - 6.343_164_5e3 / t_kel;
    let psv = psv1.exp() * psv2.exp();

    let h = rh * enh * psv / p;
    let xw = h / 100.0;
    let xc = 400.0e-6;

    let c1 = 0.603_055 * t + 331.502_4 - t * t * 5.28e-4
        + (0.149_587_4 * t + 51.471_935 - t * t * 7.82e-4) * xw;
    let c2 = (-1.82e-7 + 3.73e-8 * t - t * t * 2.93e-10) * p
        + (-85.209_31 - 0.228_525 * t + t * t * 5.91e-5) * xc;
    let c3 = xw * xw * 2.835_149 - p * p * 2.15e-13 + xc * xc * 29.179_762 + 4.86e-4 * xw * p * xc;

    c1 + c2 - c3
}

/// Atmospheric absorption in dB/m per band by the ISO 9613-1 model.
pub fn air_absorption(
    temp_c: f32,
    pressure_kpa: f32,
    humidity: f32,
    bands: &FrequencyBands,
) -> BandResponse {
    let pres = 1000.0 * pressure_kpa.clamp(0.0, 1000.0);
    let temp = temp_c.clamp(-273.15, 100_000.0) + 273.15;
    let relh = humidity.clamp(0.0, 100.0);

    // Relative pressure and molar concentration of water vapor.
    let pres = pres / 101_325.0;
    let c_humid = 4.6151 - 6.8346 * (273.15 / temp).powf(1.261);
    let hum = relh * 10.0_f32.powf(c_humid) * pres;

    let tempr = temp / 293.15;

    // Relaxation frequencies of oxygen and nitrogen.
    let fr_o = pres * (24.0 + 4.04e4 * hum * (0.02 + hum) / (0.391 + hum));
    let fr_n = pres
        * tempr.powf(-0.5)
        * (9.0 + 280.0 * hum * (-4.17 * (tempr.powf(-1.0 / 3.0) - 1.0)).exp());

    let mut result = BandResponse::zero();
    for b in 0..result.band_count() {
        let freq = bands.center(b);
        let freq2 = freq * freq;
        let alpha = 8.686
            * freq2
            * (1.84e-11 * (1.0 / pres) * tempr.sqrt()
                + tempr.powf(-2.5)
                    * (0.012_75 * ((-2239.1 / temp).exp() / (fr_o + freq2 / fr_o))
                        + 0.1068 * ((-3352.0 / temp).exp() / (fr_n + freq2 / fr_n))));
        result[b] = 0.5 * alpha;
    }
    result
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_speed_of_sound_room_temperature() {
        let c = air_speed_of_sound(20.0, 101.325, 50.0);
        assert_relative_eq!(c, 343.0, epsilon = 2.0);
    }

    #[test]
    fn test_speed_increases_with_temperature() {
        let cold = air_speed_of_sound(0.0, 101.325, 50.0);
        let warm = air_speed_of_sound(30.0, 101.325, 50.0);
        assert!(warm > cold);
    }

    #[test]
    fn test_attenuation_at_zero_distance_is_unit() {
        let medium = Medium::default();
        let a = medium.attenuation(0.0);
        for b in 0..a.band_count() {
            assert_relative_eq!(a[b], 1.0);
        }
    }

    #[test]
    fn test_attenuation_strictly_decreasing() {
        let medium = Medium::default();
        let near = medium.attenuation(10.0);
        let far = medium.attenuation(100.0);
        for b in 0..near.band_count() {
            assert!(far[b] < near[b]);
            assert!(near[b] < 1.0);
            assert!(far[b] > 0.0);
        }
    }

    #[test]
    fn test_absorption_rises_with_frequency() {
        let medium = Medium::default();
        let a = medium.absorption();
        assert!(a[a.band_count() - 1] > a[0]);
        for b in 0..a.band_count() {
            assert!(a[b] >= 0.0);
        }
    }

    #[test]
    fn test_negative_speed_clamped() {
        let medium = Medium::new(-10.0, BandResponse::zero());
        assert_eq!(medium.speed(), 0.0);
    }
}
