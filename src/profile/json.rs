//! Loader for Rekall style JSON profiles.
//!
//! A profile document has three sections:
//!
//! ```text
//! {
//!   "$METADATA": { "arch": "AMD64", "os": "windows", "version": "10.0.19041" },
//!   "$CONSTANTS": { "PsActiveProcessHead": 18446735277663260992 },
//!   "$STRUCTS": {
//!     "_LIST_ENTRY": [16, {
//!       "Flink": [0, ["Pointer", { "target": "_LIST_ENTRY" }]],
//!       "Blink": [8, ["Pointer", { "target": "_LIST_ENTRY" }]]
//!     }]
//!   }
//! }
//! ```
//!
//! Overlay documents use the same struct notation, with `null` sizes and offsets meaning
//! "keep what the type already has".

use super::layout::{FieldKind, Primitive};
use super::overlay::{Catalog, FieldPatch, Overlay, TypePatch};
use super::{Architecture, Profile, ProfileBuilder};

use memflow::prelude::v1::*;

use serde_json::{Map, Value as Json};

use log::*;

const DEFAULT_STRING_LENGTH: usize = 256;

/// `_EX_FAST_REF` reference count bits.
pub const FAST_REF_BITS_A64: u8 = 4;
pub const FAST_REF_BITS_A32: u8 = 3;

fn config_error(msg: impl std::fmt::Display) -> Error {
    Error(ErrorOrigin::OsLayer, ErrorKind::Configuration).log_error(msg)
}

fn offset_error(msg: impl std::fmt::Display) -> Error {
    Error(ErrorOrigin::OsLayer, ErrorKind::Offset).log_error(msg)
}

/// Parser settings derived from the document metadata.
#[derive(Clone, Copy, Debug)]
pub struct JsonContext {
    pub long_width: usize,
    pub fast_ref_bits: u8,
}

impl Default for JsonContext {
    fn default() -> Self {
        Self {
            long_width: 4,
            fast_ref_bits: FAST_REF_BITS_A64,
        }
    }
}

impl JsonContext {
    fn from_metadata(metadata: &[(String, String)]) -> Result<Self> {
        let get = |key: &str| {
            metadata
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let arch = get("arch").map(str::parse::<Architecture>).transpose()?;
        let linux = get("os") == Some("linux");

        Ok(Self {
            long_width: match arch {
                Some(Architecture::A64) if linux => 8,
                _ => 4,
            },
            fast_ref_bits: match arch {
                Some(Architecture::A32) => FAST_REF_BITS_A32,
                _ => FAST_REF_BITS_A64,
            },
        })
    }
}

fn parse_document(src: &str) -> Result<Map<String, Json>> {
    match serde_json::from_str(src) {
        Ok(Json::Object(map)) => Ok(map),
        Ok(_) => Err(config_error("profile document is not an object")),
        Err(err) => Err(config_error(format!("malformed profile document: {}", err))),
    }
}

fn parse_metadata(doc: &Map<String, Json>) -> Vec<(String, String)> {
    match doc.get("$METADATA") {
        Some(Json::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Json::String(s) => (k.clone(), s.clone()),
                other => (k.clone(), other.to_string()),
            })
            .collect(),
        _ => vec![],
    }
}

fn parse_constants(doc: &Map<String, Json>) -> Result<Vec<(String, Address)>> {
    match doc.get("$CONSTANTS") {
        Some(Json::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                v.as_u64()
                    .map(|a| (k.clone(), Address::from(a)))
                    .ok_or_else(|| offset_error(format!("constant {} is not numeric: {}", k, v)))
            })
            .collect(),
        Some(other) => Err(config_error(format!("$CONSTANTS is not an object: {}", other))),
        None => Ok(vec![]),
    }
}

fn parse_usize(value: &Json, what: impl FnOnce() -> String) -> Result<Option<usize>> {
    match value {
        Json::Null => Ok(None),
        Json::Number(n) => n
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| offset_error(format!("{} is not an unsigned integer: {}", what(), n))),
        other => Err(offset_error(format!("{} is not numeric: {}", what(), other))),
    }
}

fn arg_str<'a>(args: Option<&'a Map<String, Json>>, key: &str) -> Option<&'a str> {
    args?.get(key)?.as_str()
}

fn arg_u64(args: Option<&Map<String, Json>>, key: &str) -> Option<u64> {
    args?.get(key)?.as_u64()
}

fn kind_from_name(name: &str, ctx: &JsonContext) -> FieldKind {
    match Primitive::from_name(name, ctx.long_width) {
        Some(p) => FieldKind::Primitive(p),
        None => FieldKind::Struct(name.to_string()),
    }
}

/// Descriptor names that take arguments, as opposed to plain type names.
const DESCRIPTORS: &[&str] = &[
    "Pointer",
    "Pointer32",
    "Pointer64",
    "FastRef",
    "_EX_FAST_REF",
    "Array",
    "BitField",
    "String",
    "Enumeration",
    "Flags",
];

fn is_descriptor(name: &str) -> bool {
    DESCRIPTORS.contains(&name)
}

/// Pointed to type name. Pointers to pointers or arrays are kept as untyped addresses.
fn pointee<'a>(args: Option<&'a Map<String, Json>>) -> &'a str {
    match arg_str(args, "target") {
        Some(target) if is_descriptor(target) => {
            debug!("pointer to {} decodes as an address", target);
            "void"
        }
        Some(target) => target,
        None => "void",
    }
}

/// Array element descriptor, built from `target` and its `target_args`.
fn parse_element(args: Option<&Map<String, Json>>, ctx: &JsonContext) -> Result<FieldKind> {
    match args.and_then(|a| a.get("target")) {
        Some(Json::String(target)) if is_descriptor(target) => {
            let target_args = args
                .and_then(|a| a.get("target_args"))
                .cloned()
                .unwrap_or_else(|| Json::Object(Map::new()));
            parse_kind(&Json::Array(vec![Json::String(target.clone()), target_args]), ctx)
        }
        Some(Json::String(target)) => Ok(kind_from_name(target, ctx)),
        Some(nested @ Json::Array(_)) => parse_kind(nested, ctx),
        _ => Ok(FieldKind::Primitive(Primitive::U8)),
    }
}

/// Parses a type descriptor such as `["Pointer", {"target": "_EPROCESS"}]`.
pub fn parse_kind(desc: &Json, ctx: &JsonContext) -> Result<FieldKind> {
    let parts = desc
        .as_array()
        .ok_or_else(|| config_error(format!("type descriptor is not a list: {}", desc)))?;

    let name = parts
        .get(0)
        .and_then(Json::as_str)
        .ok_or_else(|| config_error(format!("type descriptor has no name: {}", desc)))?;

    let args = parts.get(1).and_then(Json::as_object);

    let kind = match name {
        "Pointer" | "Pointer32" | "Pointer64" => FieldKind::pointer(pointee(args)),
        "FastRef" | "_EX_FAST_REF" => FieldKind::tagged_pointer(
            pointee(args),
            arg_u64(args, "tag_bits")
                .map(|b| b as u8)
                .unwrap_or(ctx.fast_ref_bits),
        ),
        "Array" => {
            let count = arg_u64(args, "count").unwrap_or(0) as usize;
            FieldKind::array(parse_element(args, ctx)?, count)
        }
        "BitField" => {
            let start = arg_u64(args, "start_bit").unwrap_or(0);
            let end = arg_u64(args, "end_bit").unwrap_or(start + 1);
            let storage = Primitive::from_name(
                arg_str(args, "target").unwrap_or("unsigned int"),
                ctx.long_width,
            )
            .ok_or_else(|| config_error(format!("bitfield storage is not a primitive: {}", desc)))?;

            if end <= start || end > 64 {
                return Err(offset_error(format!("invalid bitfield range: {}", desc)));
            }

            FieldKind::bitfield(storage, start as u8, (end - start) as u8)
        }
        "String" => FieldKind::string(
            arg_u64(args, "length")
                .map(|l| l as usize)
                .unwrap_or(DEFAULT_STRING_LENGTH),
        ),
        "Enumeration" | "Flags" => {
            let target = arg_str(args, "target").unwrap_or("unsigned int");
            match Primitive::from_name(target, ctx.long_width) {
                Some(p) => FieldKind::Primitive(p),
                None => return Err(config_error(format!("{} storage is not a primitive", name))),
            }
        }
        "void" => {
            return Err(config_error("fields can not be of type void"));
        }
        other => kind_from_name(other, ctx),
    };

    Ok(kind)
}

/// Parses a struct section into an overlay. Sizes and offsets may be `null`.
fn parse_structs(name: &str, structs: &Map<String, Json>, ctx: &JsonContext) -> Result<Overlay> {
    let mut overlay = Overlay::new(name);

    for (type_name, def) in structs {
        let def = def
            .as_array()
            .filter(|d| d.len() == 2)
            .ok_or_else(|| config_error(format!("{} is not a [size, fields] pair", type_name)))?;

        let size = parse_usize(&def[0], || format!("size of {}", type_name))?;

        let fields = def[1]
            .as_object()
            .ok_or_else(|| config_error(format!("fields of {} are not an object", type_name)))?;

        let mut patch = TypePatch {
            size,
            fields: Vec::with_capacity(fields.len()),
        };

        for (field_name, field) in fields {
            let field = field
                .as_array()
                .filter(|f| f.len() == 2)
                .ok_or_else(|| {
                    config_error(format!("{}.{} is not an [offset, type] pair", type_name, field_name))
                })?;

            let offset = parse_usize(&field[0], || format!("offset of {}.{}", type_name, field_name))?;
            let kind = parse_kind(&field[1], ctx)?;

            patch.fields.push(FieldPatch {
                name: field_name.clone(),
                offset,
                kind,
            });
        }

        overlay.push_patch(type_name, patch);
    }

    trace!("parsed {} types from {}", structs.len(), name);

    Ok(overlay)
}

impl ProfileBuilder {
    /// Starts a builder from a complete JSON profile.
    ///
    /// Further overlays can be layered on top of the returned builder.
    pub fn from_json(src: &str) -> Result<Self> {
        let doc = parse_document(src)?;

        let metadata = parse_metadata(&doc);
        let ctx = JsonContext::from_metadata(&metadata)?;
        let constants = parse_constants(&doc)?;

        let structs = match doc.get("$STRUCTS") {
            Some(Json::Object(map)) => parse_structs("json", map, &ctx)?,
            Some(other) => return Err(config_error(format!("$STRUCTS is not an object: {}", other))),
            None => Overlay::new("json"),
        };
        let catalog = Catalog::from_overlay(&structs)?;

        let mut builder = ProfileBuilder::new();
        for (key, value) in &metadata {
            builder = builder.metadata(key, value);
        }

        Ok(builder.base_catalog(catalog).constants(constants))
    }
}

impl Profile {
    pub fn from_json(src: &str) -> Result<Self> {
        ProfileBuilder::from_json(src)?.build()
    }
}

impl Overlay {
    /// Parses an overlay document, either a bare struct map or one wrapped in `$STRUCTS`.
    pub fn from_json(name: &str, src: &str, ctx: &JsonContext) -> Result<Self> {
        let doc = parse_document(src)?;

        match doc.get("$STRUCTS") {
            Some(Json::Object(map)) => parse_structs(name, map, ctx),
            Some(other) => Err(config_error(format!("$STRUCTS is not an object: {}", other))),
            None => parse_structs(name, &doc, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "$METADATA": { "arch": "AMD64", "os": "linux", "version": "5.10.0" },
        "$CONSTANTS": { "init_task": 4096 },
        "$STRUCTS": {
            "list_head": [16, {
                "next": [0, ["Pointer", { "target": "list_head" }]],
                "prev": [8, ["Pointer", { "target": "list_head" }]]
            }],
            "task_struct": [64, {
                "pid": [0, ["int"]],
                "flags": [4, ["BitField", { "start_bit": 2, "end_bit": 5, "target": "unsigned int" }]],
                "counter": [8, ["unsigned long"]],
                "children": [16, ["list_head"]],
                "comm": [32, ["String", { "length": 16 }]],
                "slots": [48, ["Array", { "count": 2, "target": "unsigned long" }]]
            }]
        }
    }"#;

    #[test]
    fn parse_profile() {
        let profile = Profile::from_json(PROFILE).unwrap();

        assert_eq!(profile.architecture(), Some(Architecture::A64));
        assert_eq!(profile.lookup_constant("init_task"), Some(Address::from(4096)));

        let task = profile.lookup_type("task_struct").unwrap();
        assert_eq!(task.size(), 64);

        let names = task.fields().map(|(n, _)| n).collect::<Vec<_>>();
        assert_eq!(names.len(), 6);

        assert!(matches!(
            task.field("counter").unwrap().kind,
            FieldKind::Primitive(Primitive::U64)
        ));
        assert!(matches!(
            task.field("flags").unwrap().kind,
            FieldKind::Bitfield {
                storage: Primitive::U32,
                start: 2,
                width: 3
            }
        ));
        assert!(matches!(task.field("children").unwrap().kind, FieldKind::Struct(_)));
        assert_eq!(profile.kind_size(&task.field("slots").unwrap().kind), Some(16));
    }

    #[test]
    fn non_numeric_offset_is_fatal() {
        let doc = r#"{ "$STRUCTS": { "T": [8, { "a": ["zero", ["int"]] }] } }"#;
        let err = Profile::from_json(doc).unwrap_err();
        assert_eq!(err.1, ErrorKind::Offset);
    }

    #[test]
    fn null_offset_is_fatal_in_profiles() {
        let doc = r#"{ "$STRUCTS": { "T": [8, { "a": [null, ["int"]] }] } }"#;
        assert!(Profile::from_json(doc).is_err());
    }

    #[test]
    fn malformed_document_is_fatal() {
        assert_eq!(
            Profile::from_json("{ not json").unwrap_err().1,
            ErrorKind::Configuration
        );
        assert!(Profile::from_json("[]").is_err());
    }

    #[test]
    fn overlay_document_inherits_offsets() {
        let overlay = Overlay::from_json(
            "fast-ref",
            r#"{ "_IMAGE_ENTRY_IN_SESSION": [null, { "Address": [null, ["FastRef"]] }] }"#,
            &JsonContext::default(),
        )
        .unwrap();

        let profile = ProfileBuilder::new()
            .base_catalog(
                Catalog::new().with_type(
                    crate::profile::TypeLayout::new("_IMAGE_ENTRY_IN_SESSION", 0x40)
                        .with_field("Address", 0x28, FieldKind::pointer("void")),
                ),
            )
            .overlay(overlay)
            .build()
            .unwrap();

        let field = profile
            .lookup_type("_IMAGE_ENTRY_IN_SESSION")
            .unwrap()
            .field("Address")
            .unwrap();
        assert_eq!(field.offset, 0x28);
        assert!(matches!(
            field.kind,
            FieldKind::Pointer {
                tag_bits: FAST_REF_BITS_A64,
                ..
            }
        ));
    }

    #[test]
    fn nested_descriptors_use_target_args() {
        let doc = r#"{
            "$METADATA": { "arch": "AMD64" },
            "$STRUCTS": {
                "X": [8, { "v": [0, ["unsigned int"]] }],
                "H": [24, {
                    "ptrs": [0, ["Array", {
                        "count": 2,
                        "target": "Pointer",
                        "target_args": { "target": "X" }
                    }]],
                    "table": [16, ["Pointer", {
                        "target": "Array",
                        "target_args": { "count": 4, "target": "X" }
                    }]]
                }]
            }
        }"#;
        let profile = Profile::from_json(doc).unwrap();

        let ptrs = &profile.lookup_type("H").unwrap().field("ptrs").unwrap().kind;
        assert_eq!(profile.kind_size(ptrs), Some(16));

        let mut h = vec![0u8; 24];
        h[0..8].copy_from_slice(&0x2000u64.to_le_bytes());
        h[16..24].copy_from_slice(&0x3000u64.to_le_bytes());
        let mut x = vec![0u8; 8];
        x[0] = 7;

        let space = crate::space::SparseSpace::new()
            .with_range(0x1000.into(), h)
            .unwrap()
            .with_range(0x2000.into(), x)
            .unwrap();
        let h = profile.instantiate("H", 0x1000.into(), &space).unwrap();

        assert_eq!(h.get("ptrs").index(0).get("v").as_u64(), Some(7));
        assert_eq!(
            h.get("ptrs").index(1).absent(),
            Some(crate::object::Absent::NullPointer)
        );
        assert_eq!(h.get("table").address(), Some(Address::from(0x3000)));
    }

    #[test]
    fn long_width_follows_platform() {
        let ctx = JsonContext::from_metadata(&[("arch".into(), "AMD64".into())]).unwrap();
        assert_eq!(ctx.long_width, 4);

        let ctx = JsonContext::from_metadata(&[
            ("arch".into(), "AMD64".into()),
            ("os".into(), "linux".into()),
        ])
        .unwrap();
        assert_eq!(ctx.long_width, 8);

        let ctx = JsonContext::from_metadata(&[("arch".into(), "I386".into())]).unwrap();
        assert_eq!(ctx.fast_ref_bits, FAST_REF_BITS_A32);
    }
}
