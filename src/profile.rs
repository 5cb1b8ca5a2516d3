pub mod json;
pub mod layout;
pub mod overlay;

pub use layout::{ComputedFn, FieldDescriptor, FieldKind, Primitive, TypeLayout};
pub use overlay::{Catalog, FieldPatch, Overlay, TypePatch};

use crate::object::{Absent, TypedObject, Value};
use crate::space::AddressSpace;
use crate::version::parse_version;
use crate::walk::WalkConfig;

use memflow::prelude::v1::*;

use std::collections::HashMap;
use std::str::FromStr;

use log::*;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    A64,
    A32,
}

impl Architecture {
    pub fn pointer_width(self) -> usize {
        match self {
            Architecture::A64 => 8,
            Architecture::A32 => 4,
        }
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A64" | "AMD64" | "x64" | "x86_64" => Ok(Architecture::A64),
            "A32" | "I386" | "x86" | "i386" => Ok(Architecture::A32),
            _ => Err(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArchitecture)
                .log_error(format!("unknown architecture {}", s))),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug)]
enum BuildStep {
    Metadata(String, String),
    Base(Catalog),
    Overlay(Overlay, Option<Architecture>),
    Constants(Vec<(String, Address)>),
}

/// Records the ordered steps a profile is composed of.
///
/// Nothing is merged until [`build`](Self::build) runs, which executes the steps in exactly
/// the order they were added. Versioned initializers extend a builder by first calling the
/// initializer of the previous version and then adding their own overlays.
#[derive(Clone, Debug, Default)]
pub struct ProfileBuilder {
    steps: Vec<BuildStep>,
    walk_config: WalkConfig,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.steps
            .push(BuildStep::Metadata(key.to_string(), value.to_string()));
        self
    }

    pub fn arch(self, arch: Architecture) -> Self {
        self.metadata("arch", &arch.to_string())
    }

    /// Installs complete layouts. Types already present are replaced as a whole.
    pub fn base_catalog(mut self, catalog: Catalog) -> Self {
        self.steps.push(BuildStep::Base(catalog));
        self
    }

    pub fn overlay(mut self, overlay: Overlay) -> Self {
        self.steps.push(BuildStep::Overlay(overlay, None));
        self
    }

    /// Adds an overlay that only applies when the profile architecture is `arch`.
    pub fn overlay_for(mut self, arch: Architecture, overlay: Overlay) -> Self {
        self.steps.push(BuildStep::Overlay(overlay, Some(arch)));
        self
    }

    pub fn constant(self, name: &str, address: Address) -> Self {
        self.constants(Some((name.to_string(), address)))
    }

    pub fn constants(mut self, constants: impl IntoIterator<Item = (String, Address)>) -> Self {
        self.steps
            .push(BuildStep::Constants(constants.into_iter().collect()));
        self
    }

    pub fn walk_config(mut self, config: WalkConfig) -> Self {
        self.walk_config = config;
        self
    }

    /// The latest value recorded for a metadata key so far.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.steps.iter().rev().find_map(|s| match s {
            BuildStep::Metadata(k, v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    /// Whether any base catalog or overlay added so far declares `type_name.field`.
    pub fn declares_field(&self, type_name: &str, field: &str) -> bool {
        self.steps.iter().any(|s| match s {
            BuildStep::Base(catalog) => catalog
                .types()
                .any(|t| t.name() == type_name && t.field(field).is_some()),
            BuildStep::Overlay(overlay, _) => overlay
                .patches()
                .any(|(name, patch)| name == type_name && patch.fields.iter().any(|f| f.name == field)),
            _ => false,
        })
    }

    pub fn build(self) -> Result<Profile> {
        let mut profile = Profile {
            types: HashMap::new(),
            constants: HashMap::new(),
            metadata: HashMap::new(),
            arch: None,
            little_endian: true,
            walk_config: self.walk_config,
            history: vec![],
        };

        for step in self.steps {
            match step {
                BuildStep::Metadata(key, value) => {
                    match key.as_str() {
                        "arch" => {
                            let arch = value.parse::<Architecture>()?;
                            match profile.arch {
                                Some(prev) if prev != arch => {
                                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Configuration)
                                        .log_error(format!(
                                            "architecture changes from {} to {} while building",
                                            prev, arch
                                        )))
                                }
                                _ => profile.arch = Some(arch),
                            }
                        }
                        "endian" => {
                            profile.little_endian = match value.as_str() {
                                "little" => true,
                                "big" => false,
                                _ => {
                                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Configuration)
                                        .log_error(format!("unknown endianness {}", value)))
                                }
                            }
                        }
                        _ => {}
                    }
                    profile.metadata.insert(key, value);
                }
                BuildStep::Base(catalog) => {
                    debug!("installing base catalog with {} types", catalog.len());
                    catalog.install(&mut profile.types);
                    profile.history.push("base".to_string());
                }
                BuildStep::Overlay(overlay, filter) => match (filter, profile.arch) {
                    (Some(_), None) => {
                        return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Configuration)
                            .log_error(format!(
                                "overlay {} is architecture specific, but the profile has no architecture",
                                overlay.name()
                            )))
                    }
                    (Some(want), Some(arch)) if want != arch => {
                        debug!("skipping overlay {} ({} != {})", overlay.name(), want, arch);
                        profile
                            .history
                            .push(format!("{} (skipped, {} only)", overlay.name(), want));
                    }
                    _ => {
                        debug!("applying overlay {}", overlay.name());
                        overlay.apply(&mut profile.types)?;
                        profile.history.push(overlay.name().to_string());
                    }
                },
                BuildStep::Constants(constants) => {
                    profile.constants.extend(constants);
                }
            }
        }

        profile.validate()?;

        info!(
            "profile built: {} types, {} constants, arch {:?}",
            profile.types.len(),
            profile.constants.len(),
            profile.arch
        );

        Ok(profile)
    }
}

/// Flattened catalog of type layouts, constants and metadata for one OS build.
///
/// A profile is immutable once built and can be shared by any number of concurrent readers.
#[derive(Debug)]
pub struct Profile {
    types: HashMap<String, TypeLayout>,
    constants: HashMap<String, Address>,
    metadata: HashMap<String, String>,
    arch: Option<Architecture>,
    little_endian: bool,
    walk_config: WalkConfig,
    history: Vec<String>,
}

impl Profile {
    pub fn builder() -> ProfileBuilder {
        ProfileBuilder::new()
    }

    pub fn lookup_type(&self, name: &str) -> Result<&TypeLayout> {
        self.types
            .get(name)
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn lookup_constant(&self, name: &str) -> Option<Address> {
        self.constants.get(name).copied()
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn architecture(&self) -> Option<Architecture> {
        self.arch
    }

    pub fn version(&self) -> Option<(usize, usize, usize)> {
        self.metadata("version").and_then(parse_version)
    }

    /// Pointer width in bytes, 64-bit unless the profile says otherwise.
    pub fn pointer_width(&self) -> usize {
        self.arch.map(Architecture::pointer_width).unwrap_or(8)
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    pub fn walk_config(&self) -> &WalkConfig {
        &self.walk_config
    }

    /// Names of the steps that built this profile, in application order.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn offset_of(&self, type_name: &str, field: &str) -> Option<usize> {
        self.types
            .get(type_name)?
            .field(field)
            .map(|f| f.offset)
    }

    /// Size in bytes occupied by a value of the given kind.
    pub fn kind_size(&self, kind: &FieldKind) -> Option<usize> {
        match kind {
            FieldKind::Primitive(p) => Some(p.width()),
            FieldKind::Pointer { .. } => Some(self.pointer_width()),
            FieldKind::Array { element, count } => self.kind_size(element)?.checked_mul(*count),
            FieldKind::Bitfield { storage, .. } => Some(storage.width()),
            FieldKind::Struct(name) => self.types.get(name).map(TypeLayout::size),
            FieldKind::String { length } => Some(*length),
            FieldKind::Computed(_) => None,
        }
    }

    /// Creates a typed view at `address`. Nothing is read until a field is accessed.
    pub fn instantiate<'a>(
        &'a self,
        type_name: &str,
        address: Address,
        space: &'a dyn AddressSpace,
    ) -> Option<TypedObject<'a>> {
        match self.types.get(type_name) {
            Some(layout) => Some(TypedObject::new(self, layout, address, space)),
            None => {
                trace!("unknown type {}", type_name);
                None
            }
        }
    }

    /// Views the named constant as an object of `type_name`.
    pub fn constant_object<'a>(
        &'a self,
        name: &str,
        type_name: &str,
        space: &'a dyn AddressSpace,
    ) -> Value<'a> {
        match self.lookup_constant(name) {
            Some(address) => self
                .instantiate(type_name, address, space)
                .map(Value::Object)
                .unwrap_or(Value::Absent(Absent::UnknownType)),
            None => Value::Absent(Absent::UnknownConstant),
        }
    }

    fn validate(&self) -> Result<()> {
        for layout in self.types.values() {
            for (name, field) in layout.fields() {
                self.validate_kind(layout.name(), name, &field.kind, false)?;
            }
        }
        Ok(())
    }

    fn validate_kind(&self, type_name: &str, field: &str, kind: &FieldKind, nested: bool) -> Result<()> {
        match kind {
            FieldKind::Bitfield {
                storage,
                start,
                width,
            } => {
                if *width == 0 || *start as usize + *width as usize > storage.width() * 8 {
                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Offset).log_error(
                        format!(
                            "bitfield {}.{} does not fit into {:?}",
                            type_name, field, storage
                        ),
                    ));
                }
            }
            FieldKind::Pointer { target, tag_bits } => {
                if *tag_bits >= 16 {
                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Offset)
                        .log_error(format!("pointer {}.{} has {} tag bits", type_name, field, tag_bits)));
                }
                if target != "void" && !self.has_type(target) {
                    warn!("{}.{} points to unknown type {}", type_name, field, target);
                }
            }
            FieldKind::Struct(name) => {
                if !self.has_type(name) {
                    warn!("{}.{} embeds unknown type {}", type_name, field, name);
                }
            }
            FieldKind::Array { element, .. } => {
                self.validate_kind(type_name, field, element, true)?;
            }
            FieldKind::Computed(_) if nested => {
                return Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotSupported)
                    .log_error(format!("array {}.{} of computed elements", type_name, field)));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SparseSpace;

    fn catalog() -> Catalog {
        Catalog::new().with_type(
            TypeLayout::new("_IMAGE_ENTRY_IN_SESSION", 0x40)
                .with_field("Link", 0, FieldKind::structure("_LIST_ENTRY"))
                .with_field("Address", 0x10, FieldKind::pointer("void")),
        )
    }

    fn arch_overlays(builder: ProfileBuilder) -> ProfileBuilder {
        builder
            .overlay_for(
                Architecture::A64,
                Overlay::new("a64").field(
                    "_IMAGE_ENTRY_IN_SESSION",
                    "Address",
                    0x28,
                    FieldKind::tagged_pointer("void", 4),
                ),
            )
            .overlay_for(
                Architecture::A32,
                Overlay::new("a32").field(
                    "_IMAGE_ENTRY_IN_SESSION",
                    "Address",
                    0x14,
                    FieldKind::pointer("void"),
                ),
            )
    }

    #[test]
    fn architecture_filter_selects_one_overlay() {
        let a64 = arch_overlays(ProfileBuilder::new().arch(Architecture::A64).base_catalog(catalog()))
            .build()
            .unwrap();
        assert_eq!(a64.offset_of("_IMAGE_ENTRY_IN_SESSION", "Address"), Some(0x28));
        assert_eq!(a64.history(), &["base", "a64", "a32 (skipped, A32 only)"]);

        let a32 = arch_overlays(ProfileBuilder::new().arch(Architecture::A32).base_catalog(catalog()))
            .build()
            .unwrap();
        assert_eq!(a32.offset_of("_IMAGE_ENTRY_IN_SESSION", "Address"), Some(0x14));
        assert_eq!(a32.pointer_width(), 4);
    }

    #[test]
    fn architecture_filter_without_architecture_fails() {
        assert!(arch_overlays(ProfileBuilder::new().base_catalog(catalog()))
            .build()
            .is_err());
    }

    #[test]
    fn conflicting_architecture_fails_build() {
        let builder = ProfileBuilder::new()
            .arch(Architecture::A64)
            .base_catalog(catalog())
            .overlay_for(
                Architecture::A64,
                Overlay::new("a64").field(
                    "_IMAGE_ENTRY_IN_SESSION",
                    "Address",
                    0x28,
                    FieldKind::tagged_pointer("void", 4),
                ),
            )
            .arch(Architecture::A32)
            .overlay_for(
                Architecture::A32,
                Overlay::new("a32").field(
                    "_IMAGE_ENTRY_IN_SESSION",
                    "Address",
                    0x14,
                    FieldKind::pointer("void"),
                ),
            );

        assert_eq!(builder.build().unwrap_err().1, ErrorKind::Configuration);

        // restating the same architecture is fine
        let profile = ProfileBuilder::new()
            .metadata("arch", "AMD64")
            .arch(Architecture::A64)
            .build()
            .unwrap();
        assert_eq!(profile.architecture(), Some(Architecture::A64));
    }

    #[test]
    fn missing_types_and_constants_are_absent() {
        let space = SparseSpace::new()
            .with_range(0x1000.into(), vec![0; 0x40])
            .unwrap();
        let profile = ProfileBuilder::new()
            .arch(Architecture::A64)
            .base_catalog(catalog())
            .constant("ImageEntry", 0x1000.into())
            .build()
            .unwrap();

        assert!(profile.instantiate("_EPROCESS", 0x1000.into(), &space).is_none());
        assert!(profile
            .instantiate("_IMAGE_ENTRY_IN_SESSION", 0x1000.into(), &space)
            .is_some());

        assert_eq!(
            profile
                .constant_object("PsActiveProcessHead", "_IMAGE_ENTRY_IN_SESSION", &space)
                .absent(),
            Some(Absent::UnknownConstant)
        );
        assert_eq!(
            profile.constant_object("ImageEntry", "_EPROCESS", &space).absent(),
            Some(Absent::UnknownType)
        );

        let entry = profile.constant_object("ImageEntry", "_IMAGE_ENTRY_IN_SESSION", &space);
        assert_eq!(entry.address(), Some(Address::from(0x1000)));
        assert!(entry.get("Missing").is_absent());
    }

    #[test]
    fn constants_and_metadata() {
        let profile = ProfileBuilder::new()
            .metadata("arch", "AMD64")
            .metadata("version", "10.0.19041")
            .constant("PsActiveProcessHead", 0x1000.into())
            .build()
            .unwrap();

        assert_eq!(profile.architecture(), Some(Architecture::A64));
        assert_eq!(profile.metadata("arch"), Some("AMD64"));
        assert_eq!(profile.version(), Some((10, 0, 19041)));
        assert_eq!(
            profile.lookup_constant("PsActiveProcessHead"),
            Some(Address::from(0x1000))
        );
        assert_eq!(profile.lookup_constant("init_task"), None);
        assert!(profile.lookup_type("_EPROCESS").is_err());
    }

    #[test]
    fn invalid_bitfield_fails_build() {
        let catalog = Catalog::new().with_type(
            TypeLayout::new("T", 4).with_field("bits", 0, FieldKind::bitfield(Primitive::U8, 4, 8)),
        );

        assert!(ProfileBuilder::new().base_catalog(catalog).build().is_err());
    }

    #[test]
    fn unknown_architecture_fails_build() {
        assert!(ProfileBuilder::new().metadata("arch", "MIPS").build().is_err());
    }

    #[test]
    fn kind_sizes() {
        let profile = ProfileBuilder::new()
            .arch(Architecture::A32)
            .base_catalog(catalog())
            .build()
            .unwrap();

        assert_eq!(profile.kind_size(&FieldKind::pointer("void")), Some(4));
        assert_eq!(
            profile.kind_size(&FieldKind::array(FieldKind::structure("_IMAGE_ENTRY_IN_SESSION"), 3)),
            Some(0xc0)
        );
        assert_eq!(profile.kind_size(&FieldKind::structure("missing")), None);
    }
}
