use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid quantity {0:?}")]
    InvalidNumber(String),
    #[error("invalid unit in quantity {0:?}")]
    InvalidUnit(String),
}

/// Storage sizes as plain byte counts, so that growth can be detected
/// regardless of how a size is spelled (`1Gi` vs `1024Mi`).
pub trait QuantityParser {
    fn to_bytes(&self) -> Result<i64, ParseError>;
}

fn multiplier(unit: &str) -> Option<f64> {
    const KI: f64 = 1024.0;
    Some(match unit {
        "" => 1.0,
        "Ki" => KI,
        "Mi" => KI.powi(2),
        "Gi" => KI.powi(3),
        "Ti" => KI.powi(4),
        "Pi" => KI.powi(5),
        "Ei" => KI.powi(6),
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return None,
    })
}

impl QuantityParser for Quantity {
    fn to_bytes(&self) -> Result<i64, ParseError> {
        let raw = self.0.trim();
        let split = raw
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(raw.len());
        let (number, unit) = raw.split_at(split);

        let amount: f64 = number
            .parse()
            .map_err(|_| ParseError::InvalidNumber(raw.to_string()))?;
        let factor = multiplier(unit).ok_or_else(|| ParseError::InvalidUnit(raw.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        Ok((amount * factor).round() as i64)
    }
}
