pub mod overlays;
pub mod sessions;

pub use sessions::{
    find_session_space, session_spaces, AddressResolver, ProcessEntry, SessionImage, SessionInfo,
    SessionSpaces,
};

use crate::profile::{Architecture, Profile, ProfileBuilder};
use crate::space::AddressSpace;
use crate::version::{parse_version, VersionRange};
use crate::walk::ListWalk;

use memflow::prelude::v1::*;

use log::*;

/// Overlays for Windows 7 up to Windows 8.1.
pub fn initialize_windows7(builder: ProfileBuilder) -> ProfileBuilder {
    builder.overlay(overlays::common())
}

/// Overlays for Windows 10 and later, layered on top of the earlier versions.
pub fn initialize_windows10(builder: ProfileBuilder) -> ProfileBuilder {
    initialize_windows7(builder)
        .overlay(overlays::win10())
        .overlay_for(Architecture::A64, overlays::win10_a64())
        .overlay_for(Architecture::A32, overlays::win10_a32())
}

/// Adds the overlay chain matching a Windows `(major, minor, build)` version.
pub fn initialize(builder: ProfileBuilder, version: (usize, usize, usize)) -> ProfileBuilder {
    if VersionRange::since(10) == version {
        debug!("windows {}.{}.{}: using the windows 10 overlays", version.0, version.1, version.2);
        initialize_windows10(builder)
    } else {
        debug!("windows {}.{}.{}: using the windows 7 overlays", version.0, version.1, version.2);
        initialize_windows7(builder)
    }
}

/// Like [`initialize`], taking the version from the builder's `version` metadata.
pub fn initialize_from_metadata(builder: ProfileBuilder) -> Result<ProfileBuilder> {
    if let Some(os) = builder.metadata_value("os") {
        if os != "windows" {
            warn!("initializing a {} profile with windows overlays", os);
        }
    }

    let version = builder
        .metadata_value("version")
        .and_then(parse_version)
        .ok_or_else(|| {
            Error(ErrorOrigin::OsLayer, ErrorKind::Configuration)
                .log_error("profile metadata has no usable windows version")
        })?;

    Ok(initialize(builder, version))
}

/// Walks the kernel's active process list (`PsActiveProcessHead`).
pub fn process_list<'a>(profile: &'a Profile, space: &'a dyn AddressSpace) -> Option<ListWalk<'a>> {
    let head = profile
        .constant_object("PsActiveProcessHead", "_LIST_ENTRY", space)
        .object()?;
    Some(head.list_of_type("_EPROCESS", "ActiveProcessLinks"))
}
