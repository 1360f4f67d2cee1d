use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Composite identity of a tracked user.
///
/// Both components take part in equality: the same `user_key` under two
/// display names is two identities. The view and rebuild paths key on the
/// pair as a value, never on a delimiter-joined string.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_key: String,
    pub name: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_key: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            user_key: user_key.as_ref().trim().to_string(),
            name: name.as_ref().trim().to_string(),
        }
    }

    /// Resolves raw submission fields into an identity.
    ///
    /// Missing or null fields become empty strings; numbers and booleans are
    /// coerced to their canonical text. Never fails.
    #[must_use]
    pub fn resolve(raw_user_key: Option<&Value>, raw_name: Option<&Value>) -> Self {
        Self {
            user_key: coerce_text(raw_user_key),
            name: coerce_text(raw_name),
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_key, self.name)
    }
}

fn coerce_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Number(number)) => number_text(number),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

/// Integral floats such as `7.0` print as `7`, matching the string form a
/// client would send for the same key.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn number_text(number: &Number) -> String {
    if number.is_f64() {
        if let Some(value) = number.as_f64() {
            if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
                return (value as i64).to_string();
            }
        }
    }
    number.to_string()
}
