pub mod pstree;

pub use pstree::{PsTree, PsTreeRow, SortOrder, TaskTree};

use crate::object::{Absent, TypedObject, Value};
use crate::profile::{Overlay, ProfileBuilder};

use log::*;

fn task_uid<'a>(task: &TypedObject<'a>) -> Value<'a> {
    match task.get("cred").get("uid") {
        // kuid_t
        Value::Object(kuid) => kuid.get("val"),
        other => other,
    }
}

fn task_name<'a>(task: &TypedObject<'a>) -> Value<'a> {
    let comm = task.get("comm");
    match comm.to_string_lossy() {
        Some(name) => Value::Str(name),
        None if comm.is_absent() => comm,
        None => Value::Absent(Absent::NotAnObject),
    }
}

/// `task_struct.name`, the task's `comm` as text.
pub fn task_overlay() -> Overlay {
    Overlay::new("linux").computed("task_struct", "name", task_name)
}

/// `task_struct.uid` for kernels keeping credentials in `struct cred`.
pub fn cred_overlay() -> Overlay {
    Overlay::new("linux cred").computed("task_struct", "uid", task_uid)
}

/// Adds the Linux overlays to a profile.
///
/// Older kernels store `uid` in the task itself, their field is kept as is.
pub fn initialize(builder: ProfileBuilder) -> ProfileBuilder {
    if let Some(os) = builder.metadata_value("os") {
        if os != "linux" {
            warn!("initializing a {} profile with linux overlays", os);
        }
    }

    let builder = builder.overlay(task_overlay());

    if builder.declares_field("task_struct", "cred") {
        builder.overlay(cred_overlay())
    } else {
        debug!("task_struct has no cred, using the task uid");
        builder
    }
}
