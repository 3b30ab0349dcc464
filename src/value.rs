//! Self-describing payload values carried between stages.
//!
//! Every element flowing through a channel is a [`Value`]. The type is
//! deliberately loose (numbers, text, lists, maps) so that small reusable
//! operators can be composed without a schema; operators that need structure
//! (GetItem, Flatten, Split) inspect the variant at runtime.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Lookup key for indexed access into a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Positional index into a list.
    Index(usize),
    /// Named field of a map.
    Field(String),
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Field(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Field(s)
    }
}

/// A dynamically typed stream element.
///
/// `Value` implements total equality, ordering and hashing (floats compare by
/// `total_cmp` and hash by bit pattern) so operators like Unique and Group can
/// key on any value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Variant rank used for cross-variant ordering.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::List(_) => 5,
            Value::Map(_) => 6,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Indexed lookup, `None` on wrong shape or missing key.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        match (self, key) {
            (Value::List(items), Key::Index(i)) => items.get(*i),
            (Value::Map(fields), Key::Field(name)) => fields.get(name),
            _ => None,
        }
    }

    /// Build a list value from anything convertible to values.
    pub fn list<I, T>(items: I) -> Value
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Build the `(key, items)` pair shape emitted by grouping operators.
    pub fn pair(key: Value, items: Vec<Value>) -> Value {
        Value::List(vec![key, Value::List(items)])
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            // Mixed numeric comparison keeps Sum/Min/Max usable on mixed input.
            (Value::Int(a), Value::Float(b)) => cmp_int_float(*a, *b),
            (Value::Float(a), Value::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

/// Exact ordering of an integer against a float.
///
/// Casting the integer to f64 would lose precision above 2^53 and make the
/// order non-transitive for huge values. NaN and -0.0 keep the positions
/// `total_cmp` gives them in the Float arm, so equality stays consistent
/// with hashing.
fn cmp_int_float(a: i64, b: f64) -> Ordering {
    if b.is_nan() {
        return if b.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if b >= TWO_POW_63 {
        return Ordering::Less;
    }
    if b < -TWO_POW_63 {
        return Ordering::Greater;
    }
    match a.cmp(&(b.trunc() as i64)) {
        Ordering::Equal if b.fract() > 0.0 => Ordering::Less,
        Ordering::Equal if b.fract() < 0.0 => Ordering::Greater,
        // Int(0) hashes as +0.0, which total_cmp puts above -0.0.
        Ordering::Equal if a == 0 && b.is_sign_negative() => Ordering::Greater,
        other => other,
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            // Int and Float share a tag and representation: Int(2) and
            // Float(2.0) compare equal, so they must hash alike.
            Value::Int(n) => {
                state.write_u8(2);
                (*n as f64).to_bits().hash(state);
            }
            Value::Float(f) => {
                state.write_u8(2);
                f.to_bits().hash(state);
            }
            Value::Str(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Value::List(items) => {
                state.write_u8(5);
                for item in items {
                    item.hash(state);
                }
            }
            Value::Map(fields) => {
                state.write_u8(6);
                for (k, v) in fields {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn float_equality_is_total() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(hash_of(&Value::Float(1.5)), hash_of(&Value::Float(1.5)));
    }

    #[test]
    fn mixed_numeric_ordering() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert!(Value::Int(1) < Value::Float(1.5));
    }

    #[test]
    fn equal_numbers_hash_alike() {
        assert_eq!(hash_of(&Value::Int(2)), hash_of(&Value::Float(2.0)));
    }

    #[test]
    fn huge_integer_ordering_is_exact() {
        // 2^53 + 1 has no exact f64 representation.
        let above = Value::Int((1i64 << 53) + 1);
        let exact = Value::Float((1i64 << 53) as f64);
        assert!(above > exact);
        assert_eq!(Value::Int(1i64 << 53), exact);
        assert!(Value::Int(i64::MAX) < Value::Float(f64::INFINITY));
        assert!(Value::Int(i64::MIN) > Value::Float(f64::NEG_INFINITY));
        assert!(Value::Int(-3) > Value::Float(-3.5));
    }

    #[test]
    fn list_lookup() {
        let v = Value::list([1, 2, 3]);
        assert_eq!(v.get(&Key::Index(1)), Some(&Value::Int(2)));
        assert_eq!(v.get(&Key::Index(9)), None);
        assert_eq!(v.get(&Key::Field("a".into())), None);
    }

    #[test]
    fn map_lookup() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Value::from("sensor_a"));
        let v = Value::Map(fields);
        assert_eq!(v.get(&Key::from("name")), Some(&Value::from("sensor_a")));
        assert_eq!(v.get(&Key::from("missing")), None);
    }

    #[test]
    fn display_renders_nested_lists() {
        let v = Value::list([Value::Int(1), Value::list([2, 3])]);
        assert_eq!(v.to_string(), "[1, [2, 3]]");
    }
}
