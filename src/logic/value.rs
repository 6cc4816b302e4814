use serde::{Deserialize, Serialize};
use std::fmt;

use crate::runtime::units::{ControllerId, UnitId};

/// Opaque reference to a host-owned object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjRef {
    /// A controllable unit in the world.
    Unit(UnitId),
    /// The building/controller that owns a program instance.
    Controller(ControllerId),
}

/// Runtime value held in a variable slot or a stack slot.
///
/// The union mirrors what instructions can move around: nothing, a number,
/// a piece of text, or an opaque reference to a host object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LValue {
    /// Absent value; cleared outputs read as `Null`.
    Null,
    /// Double-precision number.
    Num(f64),
    /// UTF-8 text.
    Str(String),
    /// Opaque host-object reference.
    Obj(ObjRef),
}

impl LValue {
    /// Coerce a literal token into a value.
    ///
    /// Numeric-looking text becomes a number, text wrapped in double quotes
    /// has the quotes stripped, anything else is kept as text verbatim.
    pub fn coerce(token: &str) -> LValue {
        if let Ok(num) = token.parse::<f64>() {
            return LValue::Num(num);
        }
        if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
            return LValue::Str(token[1..token.len() - 1].to_string());
        }
        LValue::Str(token.to_string())
    }

    /// Numeric view used by arithmetic and jump conditions.
    ///
    /// Numbers pass through, object references count as 1, everything else
    /// as 0.
    pub fn as_num(&self) -> f64 {
        match self {
            LValue::Num(num) => *num,
            LValue::Obj(_) => 1.0,
            LValue::Null | LValue::Str(_) => 0.0,
        }
    }

    /// Text view, when the value is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            LValue::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Unit reference, when the value holds one.
    pub fn as_unit(&self) -> Option<UnitId> {
        match self {
            LValue::Obj(ObjRef::Unit(unit)) => Some(*unit),
            _ => None,
        }
    }

    /// Whether the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, LValue::Null)
    }
}

impl Default for LValue {
    fn default() -> Self {
        LValue::Null
    }
}

impl fmt::Display for LValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LValue::Null => write!(f, "null"),
            LValue::Num(num) => {
                if num.fract() == 0.0 && num.is_finite() && num.abs() < 1e15 {
                    write!(f, "{}", *num as i64)
                } else {
                    write!(f, "{}", num)
                }
            }
            LValue::Str(text) => write!(f, "{}", text),
            LValue::Obj(ObjRef::Unit(unit)) => write!(f, "unit#{}", unit),
            LValue::Obj(ObjRef::Controller(ctrl)) => write!(f, "controller#{}", ctrl),
        }
    }
}

impl From<f64> for LValue {
    fn from(num: f64) -> Self {
        LValue::Num(num)
    }
}

impl From<&str> for LValue {
    fn from(text: &str) -> Self {
        LValue::Str(text.to_string())
    }
}

impl From<UnitId> for LValue {
    fn from(unit: UnitId) -> Self {
        LValue::Obj(ObjRef::Unit(unit))
    }
}
