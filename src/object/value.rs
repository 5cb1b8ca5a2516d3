use super::{decode, TypedObject};
use crate::profile::{FieldKind, Profile};
use crate::space::AddressSpace;
use crate::walk::Sequence;

use memflow::prelude::v1::*;

use std::fmt;

/// Why a value could not be produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Absent {
    /// The backing memory at this address could not be read.
    Unreadable(Address),
    NullPointer,
    UnknownType,
    UnknownField,
    UnknownConstant,
    /// A field was requested from something that is not an object.
    NotAnObject,
    OutOfBounds,
}

/// Result of a field access.
///
/// `Absent` is sticky: accessing anything on it yields it again, it is falsy, and it never
/// compares equal to anything, itself included. Chains of accesses over corrupt memory thus
/// collapse into a single absent value instead of failing.
#[derive(Clone)]
pub enum Value<'a> {
    Unsigned(u64),
    Signed(i64),
    /// A pointer whose target has no known type.
    Address(Address),
    Str(String),
    Object(TypedObject<'a>),
    Array(ArrayView<'a>),
    Sequence(Sequence<'a>),
    Absent(Absent),
}

impl<'a> Value<'a> {
    pub fn get(&self, field: &str) -> Value<'a> {
        match self {
            Value::Object(obj) => obj.get(field),
            Value::Absent(absent) => Value::Absent(*absent),
            _ => Value::Absent(Absent::NotAnObject),
        }
    }

    pub fn index(&self, idx: usize) -> Value<'a> {
        match self {
            Value::Array(arr) => arr.get(idx),
            Value::Absent(absent) => Value::Absent(*absent),
            _ => Value::Absent(Absent::NotAnObject),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent(_))
    }

    pub fn is_present(&self) -> bool {
        !self.is_absent()
    }

    pub fn absent(&self) -> Option<Absent> {
        match self {
            Value::Absent(absent) => Some(*absent),
            _ => None,
        }
    }

    /// Truth value used when testing fields in conditions.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Unsigned(v) => *v != 0,
            Value::Signed(v) => *v != 0,
            Value::Address(a) => !a.is_null(),
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) | Value::Sequence(_) => true,
            Value::Array(arr) => !arr.is_empty(),
            Value::Absent(_) => false,
        }
    }

    /// Integer value. Pointers and objects convert to their address.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) => Some(*v),
            Value::Signed(v) => Some(*v as u64),
            Value::Address(a) => Some(a.to_umem() as u64),
            Value::Object(obj) => Some(obj.address().to_umem() as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Signed(v) => Some(*v),
            other => other.as_u64().map(|v| v as i64),
        }
    }

    pub fn address(&self) -> Option<Address> {
        match self {
            Value::Address(a) => Some(*a),
            Value::Object(obj) => Some(obj.address()),
            _ => None,
        }
    }

    pub fn object(&self) -> Option<TypedObject<'a>> {
        match self {
            Value::Object(obj) => Some(*obj),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Text of a string field, or of a byte array holding a nul terminated string.
    pub fn to_string_lossy(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Array(arr) => {
                let bytes = arr
                    .iter()
                    .map(|v| match v {
                        Value::Unsigned(b) if b <= 0xff => Some(b as u8),
                        Value::Signed(b) if (-128..=127).contains(&b) => Some(b as u8),
                        _ => None,
                    })
                    .take_while(|b| *b != Some(0))
                    .collect::<Option<Vec<_>>>()?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => None,
        }
    }

    /// Objects contained in this value.
    ///
    /// Sequences yield their elements, arrays their object elements and a single object
    /// yields itself. Anything else, absent values included, yields nothing.
    pub fn objects(self) -> Box<dyn Iterator<Item = TypedObject<'a>> + 'a> {
        match self {
            Value::Sequence(seq) => Box::new(seq),
            Value::Array(arr) => Box::new(arr.iter().filter_map(|v| v.object())),
            Value::Object(obj) => Box::new(Some(obj).into_iter()),
            _ => Box::new(None.into_iter()),
        }
    }
}

impl<'a> From<Option<TypedObject<'a>>> for Value<'a> {
    fn from(obj: Option<TypedObject<'a>>) -> Self {
        obj.map(Value::Object)
            .unwrap_or(Value::Absent(Absent::UnknownType))
    }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Absent(_), _) | (_, Value::Absent(_)) => false,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(_), _) | (_, Value::Array(_)) => false,
            (Value::Sequence(_), _) | (_, Value::Sequence(_)) => false,
            (a, b) => match (a.as_u64(), b.as_u64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{:#x}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Address(a) => write!(f, "0x{:x}", a),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Object(obj) => write!(f, "{:?}", obj),
            Value::Array(arr) => write!(f, "[{:?}; {}] @ 0x{:x}", arr.element, arr.count, arr.base),
            Value::Sequence(_) => write!(f, "Sequence"),
            Value::Absent(absent) => write!(f, "Absent({:?})", absent),
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Absent(_) => write!(f, "-"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Lazily decoded fixed size array.
#[derive(Clone, Copy)]
pub struct ArrayView<'a> {
    profile: &'a Profile,
    space: &'a dyn AddressSpace,
    base: Address,
    element: &'a FieldKind,
    count: usize,
    stride: usize,
}

impl<'a> ArrayView<'a> {
    pub(crate) fn new(
        profile: &'a Profile,
        space: &'a dyn AddressSpace,
        base: Address,
        element: &'a FieldKind,
        count: usize,
        stride: usize,
    ) -> Self {
        Self {
            profile,
            space,
            base,
            element,
            count,
            stride,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn get(&self, idx: usize) -> Value<'a> {
        if idx >= self.count {
            return Value::Absent(Absent::OutOfBounds);
        }

        let offset = match idx.checked_mul(self.stride) {
            Some(offset) => offset,
            None => return Value::Absent(Absent::OutOfBounds),
        };

        decode(
            self.profile,
            self.space,
            self.base.wrapping_add(Address::from(offset)),
            self.element,
        )
    }

    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter {
            array: *self,
            idx: 0,
        }
    }
}

#[derive(Clone)]
pub struct ArrayIter<'a> {
    array: ArrayView<'a>,
    idx: usize,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.array.count {
            return None;
        }
        let value = self.array.get(self.idx);
        self.idx += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.array.count - self.idx;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ArrayIter<'_> {}
