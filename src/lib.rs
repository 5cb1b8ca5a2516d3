/*!
Typed views over raw memory snapshots.

A [`Profile`](profile::Profile) is composed from a base catalog of type layouts and an ordered
chain of overlays for one operating system build and architecture. It turns addresses inside
an [`AddressSpace`](space::AddressSpace) into [`TypedObject`](object::TypedObject)s whose
fields are decoded lazily. Unreadable memory never fails a read, it produces an absent
[`Value`](object::Value) that propagates through further accesses. Linked lists and trees
are expanded into lazy, bounded sequences by the walkers in [`walk`].

```
use memflow::types::Address;
use memflow_overlay::prelude::v1::*;

let profile = ProfileBuilder::new()
    .arch(Architecture::A64)
    .base_catalog(Catalog::new().with_type(
        TypeLayout::new("T", 0x10)
            .with_field("id", 0, Primitive::U32)
            .with_field("next", 8, FieldKind::pointer("T")),
    ))
    .build()
    .unwrap();

let mut t1 = vec![0u8; 0x10];
t1[0] = 1;
t1[8..].copy_from_slice(&0x1010u64.to_le_bytes());
let mut t2 = vec![0u8; 0x10];
t2[0] = 2;
t2[8..].copy_from_slice(&0x1000u64.to_le_bytes());

let space = SparseSpace::new()
    .with_range(Address::from(0x1000u64), t1)
    .unwrap()
    .with_range(Address::from(0x1010u64), t2)
    .unwrap();

let t1 = profile.instantiate("T", 0x1000.into(), &space).unwrap();
assert_eq!(t1.get("next").get("id").as_u64(), Some(2));

let ids = walk_linked_list(t1, "next", "T", true)
    .filter_map(|t| t.get("id").as_u64())
    .collect::<Vec<_>>();
assert_eq!(ids, vec![1, 2]);
```
*/

pub mod linux;
pub mod object;
pub mod profile;
pub mod space;
pub mod version;
pub mod walk;
pub mod windows;

pub mod prelude {
    pub mod v1 {
        pub use crate::object::{Absent, ArrayView, TypedObject, Value};
        pub use crate::profile::{
            Architecture, Catalog, FieldKind, Overlay, Primitive, Profile, ProfileBuilder,
            TypeLayout,
        };
        pub use crate::space::{AddressSpace, SparseSpace, ViewSpace};
        pub use crate::version::VersionRange;
        pub use crate::walk::{
            walk_linked_list, walk_tree_inorder, ListWalk, Sequence, TreeWalk, WalkConfig,
        };
    }
    pub use v1::*;
}
