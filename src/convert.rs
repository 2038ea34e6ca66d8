//! Conduct-score to converted-score mapping.
//!
//! | Component | Conduct scale | Converted scale |
//! |-----------|---------------|-----------------|
//! | CLA-1     | 0..=20        | 0..=10          |
//! | CLA-2     | 0..=30        | 0..=15          |
//! | CLA-3     | 0..=50        | 0..=25          |
//! | External  | 0..=100       | 0..=50          |
//!
//! Conversion is `round(raw * converted_max / raw_max)` with halves rounded
//! away from zero, then clamped to the converted maximum.

use crate::error::{EngineError, Result};
use crate::models::{ComponentScore, InternalComponent, SubAssessment};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub raw_max: f64,
    pub converted_max: u32,
}

pub const CLA1_SCALE: Scale = Scale {
    raw_max: 20.0,
    converted_max: 10,
};
pub const CLA2_SCALE: Scale = Scale {
    raw_max: 30.0,
    converted_max: 15,
};
pub const CLA3_SCALE: Scale = Scale {
    raw_max: 50.0,
    converted_max: 25,
};
pub const EXTERNAL_SCALE: Scale = Scale {
    raw_max: 100.0,
    converted_max: 50,
};

/// Sum of the three internal converted maxima.
pub const INTERNAL_TOTAL_MAX: u32 =
    CLA1_SCALE.converted_max + CLA2_SCALE.converted_max + CLA3_SCALE.converted_max;
pub const GRAND_TOTAL_MAX: u32 = INTERNAL_TOTAL_MAX + EXTERNAL_SCALE.converted_max;

impl Scale {
    pub fn for_sub_assessment(sub: SubAssessment) -> Self {
        match sub {
            SubAssessment::Cla1 => CLA1_SCALE,
            SubAssessment::Cla2 => CLA2_SCALE,
            SubAssessment::Cla3 => CLA3_SCALE,
            SubAssessment::External => EXTERNAL_SCALE,
        }
    }

    pub fn for_internal(component: InternalComponent) -> Self {
        Self::for_sub_assessment(component.sub_assessment())
    }

    pub fn convert(self, raw: f64) -> Result<u32> {
        if !raw.is_finite() || raw < 0.0 || raw > self.raw_max {
            return Err(EngineError::Range(format!(
                "conduct score {raw} is outside 0..={}",
                self.raw_max
            )));
        }
        // f64::round rounds half away from zero.
        let scaled = (raw * f64::from(self.converted_max) / self.raw_max).round();
        Ok((scaled as u32).min(self.converted_max))
    }

    pub fn score(self, raw: f64) -> Result<ComponentScore> {
        Ok(ComponentScore {
            raw_score: raw,
            converted_score: self.convert(raw)?,
        })
    }
}

pub fn convert_cla1(raw: f64) -> Result<u32> {
    CLA1_SCALE.convert(raw)
}

pub fn convert_cla2(raw: f64) -> Result<u32> {
    CLA2_SCALE.convert(raw)
}

pub fn convert_cla3(raw: f64) -> Result<u32> {
    CLA3_SCALE.convert(raw)
}

pub fn convert_external(raw: f64) -> Result<u32> {
    EXTERNAL_SCALE.convert(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Scale; 4] = [CLA1_SCALE, CLA2_SCALE, CLA3_SCALE, EXTERNAL_SCALE];

    #[test]
    fn maxima_map_to_maxima() {
        assert_eq!(convert_cla1(20.0).unwrap(), 10);
        assert_eq!(convert_cla2(30.0).unwrap(), 15);
        assert_eq!(convert_cla3(50.0).unwrap(), 25);
        assert_eq!(convert_external(100.0).unwrap(), 50);
        assert_eq!(convert_cla1(0.0).unwrap(), 0);
    }

    #[test]
    fn halves_round_away_from_zero() {
        // 5 * 10 / 20 = 2.5
        assert_eq!(convert_cla1(5.0).unwrap(), 3);
        // 7 * 15 / 30 = 3.5
        assert_eq!(convert_cla2(7.0).unwrap(), 4);
        // 1 * 25 / 50 = 0.5
        assert_eq!(convert_cla3(1.0).unwrap(), 1);
        // 99 * 50 / 100 = 49.5
        assert_eq!(convert_external(99.0).unwrap(), 50);
        // 4.8 * 10 / 20 = 2.4
        assert_eq!(convert_cla1(4.8).unwrap(), 2);
    }

    #[test]
    fn conversion_is_monotonic_and_bounded() {
        for scale in ALL {
            let mut previous = 0;
            let steps = (scale.raw_max * 4.0) as u32;
            for step in 0..=steps {
                let raw = f64::from(step) / 4.0;
                let converted = scale.convert(raw).unwrap();
                assert!(converted >= previous, "{raw} dropped below {previous}");
                assert!(converted <= scale.converted_max);
                previous = converted;
            }
        }
    }

    #[test]
    fn out_of_domain_is_a_range_error() {
        for raw in [-1.0, 20.5, f64::NAN, f64::INFINITY] {
            let err = convert_cla1(raw).unwrap_err();
            assert!(matches!(err, EngineError::Range(_)), "{raw} accepted");
        }
        assert!(convert_external(100.01).is_err());
    }

    #[test]
    fn totals_add_up() {
        assert_eq!(INTERNAL_TOTAL_MAX, 50);
        assert_eq!(GRAND_TOTAL_MAX, 100);
    }
}
