use crate::object::{TypedObject, Value};

use std::collections::HashMap;
use std::fmt;

/// Function backing a computed field. It receives the enclosing object.
pub type ComputedFn = for<'a> fn(&TypedObject<'a>) -> Value<'a>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl Primitive {
    pub fn width(self) -> usize {
        match self {
            Primitive::U8 | Primitive::I8 => 1,
            Primitive::U16 | Primitive::I16 => 2,
            Primitive::U32 | Primitive::I32 => 4,
            Primitive::U64 | Primitive::I64 => 8,
        }
    }

    pub fn signed(self) -> bool {
        matches!(
            self,
            Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64
        )
    }

    pub fn unsigned_of_width(width: usize) -> Option<Self> {
        match width {
            1 => Some(Primitive::U8),
            2 => Some(Primitive::U16),
            4 => Some(Primitive::U32),
            8 => Some(Primitive::U64),
            _ => None,
        }
    }

    /// Maps a C type name onto a primitive.
    ///
    /// `long_width` is the width of `long`, which differs between LP64 and LLP64 targets.
    pub fn from_name(name: &str, long_width: usize) -> Option<Self> {
        let long = |signed| match (long_width, signed) {
            (8, true) => Primitive::I64,
            (8, false) => Primitive::U64,
            (_, true) => Primitive::I32,
            (_, false) => Primitive::U32,
        };

        Some(match name {
            "char" | "signed char" | "int8_t" => Primitive::I8,
            "unsigned char" | "uint8_t" | "byte" => Primitive::U8,
            "short" | "short int" | "int16_t" => Primitive::I16,
            "unsigned short" | "unsigned short int" | "uint16_t" | "wchar" => Primitive::U16,
            "int" | "int32_t" => Primitive::I32,
            "unsigned int" | "uint32_t" => Primitive::U32,
            "long" | "long int" => long(true),
            "unsigned long" | "long unsigned int" => long(false),
            "long long" | "long long int" | "__int64" | "int64_t" => Primitive::I64,
            "unsigned long long"
            | "long long unsigned int"
            | "unsigned __int64"
            | "uint64_t" => Primitive::U64,
            _ => return None,
        })
    }
}

/// How the bytes of a field are interpreted.
#[derive(Clone)]
pub enum FieldKind {
    Primitive(Primitive),
    /// Pointer to `target`. The lowest `tag_bits` bits carry a tag and are cleared before use.
    Pointer { target: String, tag_bits: u8 },
    Array { element: Box<FieldKind>, count: usize },
    /// `width` bits starting at bit `start` of a `storage` sized integer.
    Bitfield {
        storage: Primitive,
        start: u8,
        width: u8,
    },
    /// Nested structure stored inline.
    Struct(String),
    /// Nul terminated character buffer of at most `length` bytes.
    String { length: usize },
    Computed(ComputedFn),
}

impl FieldKind {
    pub fn pointer(target: &str) -> Self {
        FieldKind::Pointer {
            target: target.to_string(),
            tag_bits: 0,
        }
    }

    pub fn tagged_pointer(target: &str, tag_bits: u8) -> Self {
        FieldKind::Pointer {
            target: target.to_string(),
            tag_bits,
        }
    }

    pub fn array(element: FieldKind, count: usize) -> Self {
        FieldKind::Array {
            element: Box::new(element),
            count,
        }
    }

    pub fn bitfield(storage: Primitive, start: u8, width: u8) -> Self {
        FieldKind::Bitfield {
            storage,
            start,
            width,
        }
    }

    pub fn structure(name: &str) -> Self {
        FieldKind::Struct(name.to_string())
    }

    pub fn string(length: usize) -> Self {
        FieldKind::String { length }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, FieldKind::Computed(_))
    }
}

impl From<Primitive> for FieldKind {
    fn from(p: Primitive) -> Self {
        FieldKind::Primitive(p)
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldKind::Primitive(p) => write!(f, "{:?}", p),
            FieldKind::Pointer { target, tag_bits } if *tag_bits == 0 => {
                write!(f, "Pointer<{}>", target)
            }
            FieldKind::Pointer { target, tag_bits } => {
                write!(f, "Pointer<{}, tag {}>", target, tag_bits)
            }
            FieldKind::Array { element, count } => write!(f, "[{:?}; {}]", element, count),
            FieldKind::Bitfield {
                storage,
                start,
                width,
            } => write!(f, "{:?}[{}..{}]", storage, start, start + width),
            FieldKind::Struct(name) => write!(f, "{}", name),
            FieldKind::String { length } => write!(f, "String[{}]", length),
            FieldKind::Computed(_) => write!(f, "Computed"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub offset: usize,
    pub kind: FieldKind,
}

/// Byte layout of a single structure type.
#[derive(Clone, Debug)]
pub struct TypeLayout {
    name: String,
    size: usize,
    fields: Vec<(String, FieldDescriptor)>,
    index: HashMap<String, usize>,
}

impl TypeLayout {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            fields: vec![],
            index: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, offset: usize, kind: impl Into<FieldKind>) -> Self {
        self.set_field(
            name,
            FieldDescriptor {
                offset,
                kind: kind.into(),
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|&i| &self.fields[i].1)
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDescriptor)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Inserts or replaces a field. A replaced field keeps its declaration position.
    pub fn set_field(&mut self, name: &str, field: FieldDescriptor) {
        match self.index.get(name) {
            Some(&i) => self.fields[i].1 = field,
            None => {
                self.index.insert(name.to_string(), self.fields.len());
                self.fields.push((name.to_string(), field));
            }
        }
    }
}
