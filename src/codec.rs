//! Digit codec for numeric events.
//!
//! A realized value is clamped into the descriptor's range, normalized by
//! the unit (a power of ten), and emitted as a fixed-width vector of
//! base-10 digits. Each digit is later signed independently, so interval
//! predicates can be built against any prefix of the digit vector.

use serde::{Deserialize, Serialize};

/// Default per-digit signing message template.
pub const EVENT_STRING_TEMPLATE_DEFAULT: &str =
    "Outcome:{event_id}:{digit_index}:{digit_outcome}";

/// Power of ten as u64. Panics on exponents that overflow u64 (>19),
/// which the descriptor constructor rules out.
pub fn power_of_ten(exponent: u32) -> u64 {
    10u64.pow(exponent)
}

/// Shape of a numeric event: symbol, digit count and digit position.
///
/// `range_digit_low_pos` is the decimal position of the least significant
/// signed digit: 0 means unit 1, 1 means unit 10, and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub definition: String,
    pub range_digits: u32,
    pub range_digit_low_pos: u32,
    pub string_template: String,
}

impl EventDescriptor {
    pub fn new(definition: &str, digits: u32, digit_low_pos: u32) -> Self {
        Self {
            definition: definition.to_uppercase(),
            range_digits: digits,
            range_digit_low_pos: digit_low_pos,
            string_template: EVENT_STRING_TEMPLATE_DEFAULT.to_string(),
        }
    }

    /// Smallest representable increment (1, 10, 100, ...).
    pub fn unit(&self) -> u64 {
        power_of_ten(self.range_digit_low_pos)
    }

    /// Position of the most significant digit, e.g. low=0, digits=6 => 5.
    pub fn digit_high_pos(&self) -> u32 {
        self.range_digit_low_pos + self.range_digits - 1
    }

    pub fn min_value(&self) -> f64 {
        0.0
    }

    pub fn max_value(&self) -> f64 {
        let max_units = power_of_ten(self.range_digits) - 1;
        (max_units * self.unit()) as f64
    }

    /// Normalize a value into digits, e.g. 85652 -> [8,5,6,5] with
    /// 4 digits and unit 10.
    ///
    /// Out-of-range values are silently clamped: anything below the
    /// minimum encodes as all zeros, anything above the maximum as all
    /// nines.
    pub fn value_to_digits(&self, value: f64) -> Vec<u8> {
        let value = value.clamp(self.min_value(), self.max_value());
        let normalized = ((value - self.min_value()) / self.unit() as f64).round() as u64;
        let s = format!("{:0width$}", normalized, width = self.range_digits as usize);
        s.bytes().map(|b| b - b'0').collect()
    }

    /// Convert digits back to a value, e.g. [8,5,6,5] -> 85650 with
    /// 4 digits and unit 10.
    pub fn digits_to_value(&self, digits: &[u8]) -> f64 {
        let units = digits.iter().fold(0u64, |v, d| 10 * v + *d as u64);
        (units * self.unit()) as f64 + self.min_value()
    }

    /// Template with `{event_id}` substituted; `{digit_index}` and
    /// `{digit_outcome}` remain for per-digit substitution.
    pub fn template_for_event(&self, event_id: &str) -> String {
        self.string_template.replace("{event_id}", event_id)
    }
}

/// Compose the exact signing message for one digit of one event.
///
/// `{event_id}` is substituted first in case the caller passed the raw
/// class template rather than an event-bound one.
pub fn digit_message(template: &str, event_id: &str, digit_index: u32, digit_outcome: u8) -> String {
    template
        .replace("{event_id}", event_id)
        .replace("{digit_index}", &digit_index.to_string())
        .replace("{digit_outcome}", &digit_outcome.to_string())
}
