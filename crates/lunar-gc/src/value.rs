//! Tagged values and table keys

use crate::object::GcRef;

/// A script value. Only [`Value::Object`] participates in collection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    /// Absence of a value
    #[default]
    Nil,
    /// Boolean
    Boolean(bool),
    /// Integer number
    Integer(i64),
    /// Float number
    Number(f64),
    /// Raw host pointer, never traced
    LightUserdata(usize),
    /// Reference to a heap object
    Object(GcRef),
}

impl Value {
    /// True for nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// True when the value refers to a heap object
    pub fn is_collectable(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// The referenced object, if any
    pub fn as_object(&self) -> Option<GcRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<GcRef> for Value {
    fn from(r: GcRef) -> Self {
        Value::Object(r)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

/// Normalized table key.
///
/// Floats with an exact integer value are stored as integers so that `1` and
/// `1.0` address the same slot. Floats keep their bit pattern so the key can
/// be hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Boolean key
    Boolean(bool),
    /// Integer key
    Integer(i64),
    /// Non-integral float key, stored as bits
    Float(u64),
    /// Light userdata key
    LightUserdata(usize),
    /// Object key
    Object(GcRef),
}

impl Key {
    /// Normalize a value into a key. Nil and NaN are not valid keys.
    pub fn from_value(value: Value) -> Option<Key> {
        match value {
            Value::Nil => None,
            Value::Boolean(b) => Some(Key::Boolean(b)),
            Value::Integer(n) => Some(Key::Integer(n)),
            Value::Number(n) if n.is_nan() => None,
            Value::Number(n) => {
                // i64::MAX as f64 rounds up to 2^63, which is out of range
                if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
                    Some(Key::Integer(n as i64))
                } else {
                    Some(Key::Float(n.to_bits()))
                }
            }
            Value::LightUserdata(p) => Some(Key::LightUserdata(p)),
            Value::Object(r) => Some(Key::Object(r)),
        }
    }

    /// Back to a value
    pub fn to_value(self) -> Value {
        match self {
            Key::Boolean(b) => Value::Boolean(b),
            Key::Integer(n) => Value::Integer(n),
            Key::Float(bits) => Value::Number(f64::from_bits(bits)),
            Key::LightUserdata(p) => Value::LightUserdata(p),
            Key::Object(r) => Value::Object(r),
        }
    }

    /// The referenced object, if any
    pub fn as_object(self) -> Option<GcRef> {
        match self {
            Key::Object(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_and_nan_are_not_keys() {
        assert_eq!(Key::from_value(Value::Nil), None);
        assert_eq!(Key::from_value(Value::Number(f64::NAN)), None);
    }

    #[test]
    fn test_integral_floats_normalize() {
        assert_eq!(Key::from_value(Value::Number(3.0)), Some(Key::Integer(3)));
        assert_eq!(Key::from_value(Value::Number(-0.0)), Some(Key::Integer(0)));
        assert_eq!(
            Key::from_value(Value::Number(1.5)),
            Some(Key::Float(1.5f64.to_bits()))
        );
        assert!(matches!(
            Key::from_value(Value::Number(f64::INFINITY)),
            Some(Key::Float(_))
        ));
        assert!(matches!(
            Key::from_value(Value::Number(9.3e18)),
            Some(Key::Float(_))
        ));
    }

    #[test]
    fn test_only_objects_are_collectable() {
        let r = GcRef::new(1, 0);
        assert!(Value::Object(r).is_collectable());
        assert!(!Value::LightUserdata(0xdead).is_collectable());
        assert_eq!(Key::Object(r).to_value().as_object(), Some(r));
    }
}
