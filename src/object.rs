pub mod value;

pub use value::{Absent, ArrayIter, ArrayView, Value};

use crate::profile::{FieldKind, Primitive, Profile, TypeLayout};
use crate::space::AddressSpace;
use crate::walk::ListWalk;

use memflow::prelude::v1::*;

use dataview::DataView;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use log::*;

/// A typed view of a structure at an address inside an address space.
///
/// Views are cheap to create and copy. They hold no data of their own, every field access
/// reads the backing address space again.
#[derive(Clone, Copy)]
pub struct TypedObject<'a> {
    profile: &'a Profile,
    layout: &'a TypeLayout,
    address: Address,
    space: &'a dyn AddressSpace,
}

impl<'a> TypedObject<'a> {
    pub(crate) fn new(
        profile: &'a Profile,
        layout: &'a TypeLayout,
        address: Address,
        space: &'a dyn AddressSpace,
    ) -> Self {
        Self {
            profile,
            layout,
            address,
            space,
        }
    }

    pub fn profile(&self) -> &'a Profile {
        self.profile
    }

    pub fn layout(&self) -> &'a TypeLayout {
        self.layout
    }

    pub fn type_name(&self) -> &'a str {
        self.layout.name()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn space(&self) -> &'a dyn AddressSpace {
        self.space
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// The same type at another address.
    pub fn at(&self, address: Address) -> Self {
        Self { address, ..*self }
    }

    /// The same memory viewed as another type.
    pub fn cast(&self, type_name: &str) -> Option<Self> {
        self.profile
            .instantiate(type_name, self.address, self.space)
    }

    /// The same type and address, read through another address space.
    pub fn rebind(&self, space: &'a dyn AddressSpace) -> Self {
        Self { space, ..*self }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.layout.field(name).is_some()
    }

    pub fn field_address(&self, name: &str) -> Option<Address> {
        self.layout
            .field(name)
            .filter(|f| !f.kind.is_computed())
            .map(|f| self.address.wrapping_add(Address::from(f.offset)))
    }

    /// Reads the whole object, `None` if any of it is unreadable.
    pub fn read_bytes(&self) -> Option<Vec<u8>> {
        self.space.read(self.address, self.layout.size())
    }

    pub fn is_readable(&self) -> bool {
        self.space.is_readable(self.address, self.layout.size())
    }

    /// Decodes a field.
    ///
    /// Unknown fields and unreadable memory produce [`Value::Absent`].
    pub fn get(&self, name: &str) -> Value<'a> {
        let layout = self.layout;
        let field = match layout.field(name) {
            Some(field) => field,
            None => {
                trace!("{} has no field {}", layout.name(), name);
                return Value::Absent(Absent::UnknownField);
            }
        };

        match &field.kind {
            FieldKind::Computed(func) => func(self),
            kind => decode(
                self.profile,
                self.space,
                self.address.wrapping_add(Address::from(field.offset)),
                kind,
            ),
        }
    }

    /// Walks the intrusive list headed by this object.
    ///
    /// This object is a list entry (`_LIST_ENTRY`, `list_head`), the yielded objects are the
    /// `element_type` records that embed their list entry at field `member`.
    pub fn list_of_type(&self, element_type: &str, member: &str) -> ListWalk<'a> {
        self.intrusive_list(element_type, member, &["Flink", "next"])
    }

    /// Like [`list_of_type`](Self::list_of_type), following the backward links.
    pub fn list_of_type_reverse(&self, element_type: &str, member: &str) -> ListWalk<'a> {
        self.intrusive_list(element_type, member, &["Blink", "prev"])
    }

    fn intrusive_list(&self, element_type: &str, member: &str, links: &[&str]) -> ListWalk<'a> {
        let link = links
            .iter()
            .copied()
            .find(|l| self.has_field(l))
            .unwrap_or(links[0]);

        match self.profile.offset_of(element_type, member) {
            Some(offset) => ListWalk::new(*self, link, element_type).adjustment(offset),
            None => {
                warn!("{} has no list member {}", element_type, member);
                ListWalk::empty(*self, link)
            }
        }
    }

    fn space_id(&self) -> usize {
        self.space as *const dyn AddressSpace as *const () as usize
    }
}

/// Decodes a value of `kind` stored at `addr`.
pub(crate) fn decode<'a>(
    profile: &'a Profile,
    space: &'a dyn AddressSpace,
    addr: Address,
    kind: &'a FieldKind,
) -> Value<'a> {
    match kind {
        FieldKind::Primitive(p) => match read_primitive(profile, space, addr, *p) {
            Some(raw) if p.signed() => Value::Signed(sign_extend(raw, p.width())),
            Some(raw) => Value::Unsigned(raw),
            None => Value::Absent(Absent::Unreadable(addr)),
        },
        FieldKind::Pointer { target, tag_bits } => {
            let width = profile.pointer_width();
            let raw = match Primitive::unsigned_of_width(width)
                .and_then(|p| read_primitive(profile, space, addr, p))
            {
                Some(raw) => raw,
                None => return Value::Absent(Absent::Unreadable(addr)),
            };

            let target_addr = raw & !((1u64 << *tag_bits) - 1);
            if target_addr == 0 {
                return Value::Absent(Absent::NullPointer);
            }

            let target_addr = Address::from(target_addr);
            match profile.instantiate(target, target_addr, space) {
                Some(obj) => Value::Object(obj),
                None => Value::Address(target_addr),
            }
        }
        FieldKind::Struct(name) => match profile.instantiate(name, addr, space) {
            Some(obj) => Value::Object(obj),
            None => Value::Absent(Absent::UnknownType),
        },
        FieldKind::Array { element, count } => match profile.kind_size(element) {
            Some(stride) => Value::Array(ArrayView::new(profile, space, addr, element, *count, stride)),
            None => Value::Absent(Absent::UnknownType),
        },
        FieldKind::Bitfield {
            storage,
            start,
            width,
        } => match read_primitive(profile, space, addr, *storage) {
            Some(raw) => {
                let mask = if *width >= 64 {
                    !0
                } else {
                    (1u64 << *width) - 1
                };
                Value::Unsigned((raw >> *start) & mask)
            }
            None => Value::Absent(Absent::Unreadable(addr)),
        },
        FieldKind::String { length } => match space.read(addr, *length) {
            Some(buf) => {
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                Value::Str(String::from_utf8_lossy(&buf[..end]).into_owned())
            }
            None => Value::Absent(Absent::Unreadable(addr)),
        },
        FieldKind::Computed(_) => Value::Absent(Absent::NotAnObject),
    }
}

fn read_primitive(
    profile: &Profile,
    space: &dyn AddressSpace,
    addr: Address,
    p: Primitive,
) -> Option<u64> {
    let mut buf = [0u8; 8];
    let buf = &mut buf[..p.width()];
    space.read_raw_into(addr, buf).ok()?;

    let view = DataView::from(&buf[..]);
    let swap = profile.little_endian() != cfg!(target_endian = "little");

    let raw = match p.width() {
        1 => view.try_read::<u8>(0)? as u64,
        2 => {
            let v = view.try_read::<u16>(0)?;
            (if swap { v.swap_bytes() } else { v }) as u64
        }
        4 => {
            let v = view.try_read::<u32>(0)?;
            (if swap { v.swap_bytes() } else { v }) as u64
        }
        _ => {
            let v = view.try_read::<u64>(0)?;
            if swap {
                v.swap_bytes()
            } else {
                v
            }
        }
    };

    Some(raw)
}

fn sign_extend(raw: u64, width: usize) -> i64 {
    let shift = 64 - width as u32 * 8;
    ((raw << shift) as i64) >> shift
}

impl PartialEq for TypedObject<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.type_name() == other.type_name()
            && self.space_id() == other.space_id()
    }
}

impl Eq for TypedObject<'_> {}

impl Hash for TypedObject<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_name().hash(state);
        self.address.to_umem().hash(state);
        self.space_id().hash(state);
    }
}

impl PartialOrd for TypedObject<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypedObject<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then_with(|| self.type_name().cmp(other.type_name()))
            .then_with(|| self.space_id().cmp(&other.space_id()))
    }
}

impl fmt::Debug for TypedObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} @ 0x{:x}", self.type_name(), self.address)
    }
}

impl fmt::Display for TypedObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Architecture, Catalog, Overlay, ProfileBuilder, TypeLayout};
    use crate::space::SparseSpace;

    fn profile(arch: Architecture) -> Profile {
        ProfileBuilder::new()
            .arch(arch)
            .base_catalog(
                Catalog::new()
                    .with_type(
                        TypeLayout::new("Inner", 8)
                            .with_field("lo", 0, Primitive::U32)
                            .with_field("hi", 4, Primitive::I32),
                    )
                    .with_type(
                        TypeLayout::new("T", 0x40)
                            .with_field("byte", 0, Primitive::U8)
                            .with_field("neg", 1, Primitive::I8)
                            .with_field("half", 2, Primitive::U16)
                            .with_field("word", 4, Primitive::U32)
                            .with_field("next", 8, FieldKind::pointer("T"))
                            .with_field("raw", 0x10, FieldKind::pointer("void"))
                            .with_field("inner", 0x18, FieldKind::structure("Inner"))
                            .with_field("flags", 0x20, FieldKind::bitfield(Primitive::U32, 4, 3))
                            .with_field("name", 0x24, FieldKind::string(8))
                            .with_field("slots", 0x2c, FieldKind::array(Primitive::U16.into(), 4))
                            .with_field("far", 0x38, FieldKind::pointer("T")),
                    ),
            )
            .overlay(Overlay::new("computed").computed("T", "double_word", |obj| {
                match obj.get("word").as_u64() {
                    Some(v) => Value::Unsigned(v * 2),
                    None => Value::Absent(Absent::NotAnObject),
                }
            }))
            .build()
            .unwrap()
    }

    fn memory() -> SparseSpace {
        let mut buf = vec![0u8; 0x40];
        buf[0] = 0x7f;
        buf[1] = 0xfe;
        buf[2..4].copy_from_slice(&0xbeefu16.to_le_bytes());
        buf[4..8].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        buf[8..0x10].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[0x10..0x18].copy_from_slice(&0xdead_0000u64.to_le_bytes());
        buf[0x18..0x1c].copy_from_slice(&7u32.to_le_bytes());
        buf[0x1c..0x20].copy_from_slice(&(-3i32).to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&0b0101_0000u32.to_le_bytes());
        buf[0x24..0x29].copy_from_slice(b"init\0");
        for i in 0..4 {
            buf[0x2c + i * 2..0x2e + i * 2].copy_from_slice(&(i as u16 * 10).to_le_bytes());
        }
        buf[0x38..0x40].copy_from_slice(&0x9000u64.to_le_bytes());

        SparseSpace::new().with_range(0x1000.into(), buf).unwrap()
    }

    #[test]
    fn fields_decode_per_descriptor() {
        let profile = profile(Architecture::A64);
        let space = memory();
        let obj = profile.instantiate("T", 0x1000.into(), &space).unwrap();

        assert_eq!(obj.get("byte").as_u64(), Some(0x7f));
        assert_eq!(obj.get("neg").as_i64(), Some(-2));
        assert_eq!(obj.get("half").as_u64(), Some(0xbeef));
        assert_eq!(obj.get("word").as_u64(), Some(0x1234_5678));
        assert_eq!(obj.get("flags").as_u64(), Some(0b101));
        assert_eq!(obj.get("name").as_str(), Some("init"));
        assert_eq!(obj.get("inner").get("lo").as_u64(), Some(7));
        assert_eq!(obj.get("inner").get("hi").as_i64(), Some(-3));
        assert_eq!(obj.get("raw").address(), Some(Address::from(0xdead_0000u64)));
        assert_eq!(obj.get("double_word").as_u64(), Some(0x2468_acf0));

        let slots = obj.get("slots");
        assert_eq!(slots.index(3).as_u64(), Some(30));
        assert!(slots.index(4).is_absent());
        match slots {
            Value::Array(arr) => {
                let all = arr.iter().filter_map(|v| v.as_u64()).collect::<Vec<_>>();
                assert_eq!(all, vec![0, 10, 20, 30]);
            }
            _ => panic!("slots is not an array"),
        }
    }

    #[test]
    fn pointer_dereference_is_identity_equal() {
        let profile = profile(Architecture::A64);
        let space = memory();
        let obj = profile.instantiate("T", 0x1000.into(), &space).unwrap();

        // next points back at the object itself
        let next = obj.get("next").object().unwrap();
        assert_eq!(next, obj);
        assert_eq!(next.get("next").get("next").object(), Some(obj));
    }

    #[test]
    fn unreadable_memory_propagates_absent() {
        let profile = profile(Architecture::A64);
        let space = memory();
        let obj = profile.instantiate("T", 0x1000.into(), &space).unwrap();

        let far = obj.get("far");
        assert!(far.truthy());
        assert_eq!(far.address(), Some(Address::from(0x9000)));

        let word = far.get("word");
        assert_eq!(word.absent(), Some(Absent::Unreadable(Address::from(0x9004))));
        assert!(!word.truthy());
        assert!(far.get("next").get("inner").get("lo").is_absent());
        assert!(far.get("double_word").is_absent());
        assert!(obj.get("missing").get("word").is_absent());
    }

    #[test]
    fn null_pointer_is_absent() {
        let profile = profile(Architecture::A64);
        let space = SparseSpace::new()
            .with_range(0x1000.into(), vec![0; 0x40])
            .unwrap();
        let obj = profile.instantiate("T", 0x1000.into(), &space).unwrap();

        assert_eq!(obj.get("next").absent(), Some(Absent::NullPointer));
        assert!(!obj.get("next").truthy());
    }

    #[test]
    fn objects_in_different_spaces_differ() {
        let profile = profile(Architecture::A64);
        let a = memory();
        let b = memory();

        let in_a = profile.instantiate("T", 0x1000.into(), &a).unwrap();
        let in_b = in_a.rebind(&b);

        assert_ne!(in_a, in_b);
        assert_eq!(in_a, profile.instantiate("T", 0x1000.into(), &a).unwrap());
        assert_ne!(Some(in_a), in_a.cast("Inner"));
    }

    #[test]
    fn thirty_two_bit_pointers() {
        let profile = profile(Architecture::A32);
        let space = memory();
        let obj = profile.instantiate("T", 0x1000.into(), &space).unwrap();

        // only the low four bytes of the pointer are used
        assert_eq!(obj.get("next").address(), Some(Address::from(0x1000)));
    }

    #[test]
    fn big_endian_profile() {
        let profile = ProfileBuilder::new()
            .metadata("endian", "big")
            .base_catalog(Catalog::new().with_type(
                TypeLayout::new("B", 4).with_field("v", 0, Primitive::U32),
            ))
            .build()
            .unwrap();
        let space = SparseSpace::new()
            .with_range(0x10.into(), vec![0x12, 0x34, 0x56, 0x78])
            .unwrap();

        let obj = profile.instantiate("B", 0x10.into(), &space).unwrap();
        assert_eq!(obj.get("v").as_u64(), Some(0x1234_5678));
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0xff, 1), -1);
        assert_eq!(sign_extend(0x7fff, 2), 0x7fff);
        assert_eq!(sign_extend(0xffff_fffe, 4), -2);
        assert_eq!(sign_extend(!0, 8), -1);
    }
}
