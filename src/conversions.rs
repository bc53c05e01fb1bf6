use serde::{Deserialize, Serialize};

/// Named unit conversion applied to a decoded channel value.
/// Mapping tables are usually authored against the sensor's native unit;
/// the conversion moves the value into the unit the dash expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    #[default]
    None,
    CToF,
    FToC,
    KpaToPsi,
    BarToPsi,
    KphToMph,
    MphToKph,
    LitresToGallons,
}

pub fn convert(value: f32, conversion: Conversion) -> f32 {
    match conversion {
        Conversion::None => value,
        Conversion::CToF => value * 9.0 / 5.0 + 32.0,
        Conversion::FToC => (value - 32.0) * 5.0 / 9.0,
        Conversion::KpaToPsi => value * 0.145_037_74,
        Conversion::BarToPsi => value * 14.503_774,
        Conversion::KphToMph => value * 0.621_371_2,
        Conversion::MphToKph => value * 1.609_344,
        Conversion::LitresToGallons => value * 0.264_172_05,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_conversions() {
        assert_eq!(convert(100.0, Conversion::CToF), 212.0);
        assert_eq!(convert(32.0, Conversion::FToC), 0.0);
        assert_eq!(convert(85.5, Conversion::None), 85.5);
    }

    #[test]
    fn test_pressure_and_speed_conversions() {
        assert!((convert(100.0, Conversion::KpaToPsi) - 14.503_774).abs() < 1e-4);
        assert!((convert(1.0, Conversion::BarToPsi) - 14.503_774).abs() < 1e-4);
        assert!((convert(100.0, Conversion::KphToMph) - 62.137_12).abs() < 1e-3);
        assert!((convert(60.0, Conversion::MphToKph) - 96.560_64).abs() < 1e-3);
    }
}
