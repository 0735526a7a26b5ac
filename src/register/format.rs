//! Presentation of decoded values at the publication boundary.

use serde::Serialize;

use super::RegisterValue;

/// Fixed-precision number followed by a unit, e.g. `230.1 V`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayFormat {
    pub precision: u8,
    pub unit: &'static str,
}

impl DisplayFormat {
    pub const fn new(precision: u8, unit: &'static str) -> Self {
        DisplayFormat { precision, unit }
    }

    pub fn apply(&self, value: f64) -> String {
        let precision = usize::from(self.precision);
        if self.unit.is_empty() {
            format!("{value:.precision$}")
        } else {
            format!("{value:.precision$} {}", self.unit)
        }
    }
}

/// A decoded value together with its display text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedValue {
    #[serde(skip)]
    pub value: RegisterValue,
    pub text: String,
}

impl FormattedValue {
    /// Labels win over numeric formatting when the value is an in-range code.
    pub fn render(
        value: &RegisterValue,
        format: Option<&DisplayFormat>,
        labels: Option<&'static [&'static str]>,
    ) -> Self {
        let label = labels.and_then(|table| value.as_code().and_then(|i| table.get(i)));
        let text = match (label, value, format) {
            (Some(label), _, _) => (*label).to_string(),
            (None, RegisterValue::Number(v), Some(fmt)) => fmt.apply(*v),
            (None, other, _) => other.to_string(),
        };
        FormattedValue {
            value: value.clone(),
            text,
        }
    }
}

impl std::fmt::Display for FormattedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}
