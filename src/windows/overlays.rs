use crate::object::{Absent, TypedObject, Value};
use crate::profile::json::FAST_REF_BITS_A64;
use crate::profile::{FieldKind, Overlay};
use crate::walk::walk_tree_inorder;

use memflow::prelude::v1::*;

pub const SESSION_SPACE: &str = "_MM_SESSION_SPACE";
pub const IMAGE_ENTRY: &str = "_IMAGE_ENTRY_IN_SESSION";

/// Session images before Windows 10, linked through `ImageList`.
fn image_list<'a>(session: &TypedObject<'a>) -> Value<'a> {
    match session.get("ImageList") {
        Value::Object(head) => Value::Sequence(head.list_of_type(IMAGE_ENTRY, "Link").into()),
        Value::Absent(absent) => Value::Absent(absent),
        _ => Value::Absent(Absent::NotAnObject),
    }
}

/// Session images from Windows 10, kept in the AVL tree `ImageTree`.
fn image_tree<'a>(session: &TypedObject<'a>) -> Value<'a> {
    match session.get("ImageTree").get("Root") {
        Value::Object(root) => {
            let adjustment = session
                .profile()
                .offset_of(IMAGE_ENTRY, "Link")
                .unwrap_or(0);
            Value::Sequence(walk_tree_inorder(root, "Left", "Right", IMAGE_ENTRY, adjustment).into())
        }
        Value::Absent(absent) => Value::Absent(absent),
        _ => Value::Absent(Absent::NotAnObject),
    }
}

/// Base of the image mapped by a session image entry.
fn image_base<'a>(image: &TypedObject<'a>) -> Value<'a> {
    match image.get("Address") {
        Value::Absent(absent) => Value::Absent(absent),
        value => match value.address() {
            Some(address) => Value::Address(address),
            None => Value::Absent(Absent::NotAnObject),
        },
    }
}

/// Computed fields shared by every supported Windows version.
pub fn common() -> Overlay {
    Overlay::new("windows")
        .computed(SESSION_SPACE, "ImageIterator", image_list)
        .computed(IMAGE_ENTRY, "ImageBase", image_base)
}

pub fn win10() -> Overlay {
    Overlay::new("win10").computed(SESSION_SPACE, "ImageIterator", image_tree)
}

/// `Address` is an `_EX_FAST_REF` whose low bits carry a reference count.
pub fn win10_a64() -> Overlay {
    Overlay::new("win10 amd64").field(
        IMAGE_ENTRY,
        "Address",
        0x28,
        FieldKind::tagged_pointer("void", FAST_REF_BITS_A64),
    )
}

pub fn win10_a32() -> Overlay {
    Overlay::new("win10 i386").field(IMAGE_ENTRY, "Address", 0x14, FieldKind::pointer("void"))
}
