/*!
Logon session analysis.

Processes point to the `_MM_SESSION_SPACE` of the session they belong to. Session space is
only mapped inside the processes of that session, so every session is re-bound into the
address space of a process that references it.
*/

use super::overlays::{IMAGE_ENTRY, SESSION_SPACE};
use crate::object::{TypedObject, Value};
use crate::space::AddressSpace;

use memflow::prelude::v1::*;

use std::collections::HashSet;
use std::fmt;

use log::*;

/// Resolves addresses to symbolic names for display.
pub trait AddressResolver {
    fn format_address(&self, address: Address) -> Option<String>;
}

impl<F: Fn(Address) -> Option<String>> AddressResolver for F {
    fn format_address(&self, address: Address) -> Option<String> {
        (self)(address)
    }
}

/// Unique sessions referenced by a set of processes.
///
/// Created by [`session_spaces`].
pub struct SessionSpaces<'a, I, F> {
    processes: I,
    space_of: F,
    seen: HashSet<umem>,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a, I, F> Iterator for SessionSpaces<'a, I, F>
where
    I: Iterator<Item = TypedObject<'a>>,
    F: FnMut(&TypedObject<'a>) -> &'a dyn AddressSpace,
{
    type Item = TypedObject<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        for process in self.processes.by_ref() {
            // the System process and other session-less processes have no session pointer
            let session = match process.get("Session") {
                Value::Object(session) => session,
                Value::Absent(absent) => {
                    trace!("{} has no session: {:?}", process, absent);
                    continue;
                }
                other => {
                    warn!("session of {} is not a {}: {:?}", process, SESSION_SPACE, other);
                    continue;
                }
            };

            if !self.seen.insert(session.address().to_umem()) {
                continue;
            }

            let space = (self.space_of)(&process);
            return Some(session.rebind(space));
        }

        None
    }
}

/// Yields the unique `_MM_SESSION_SPACE` objects referenced by `processes`.
///
/// Sessions are deduplicated by address and viewed through the address space `space_of`
/// returns for the first process referencing them.
pub fn session_spaces<'a, I, F>(processes: I, space_of: F) -> SessionSpaces<'a, I::IntoIter, F>
where
    I: IntoIterator<Item = TypedObject<'a>>,
    F: FnMut(&TypedObject<'a>) -> &'a dyn AddressSpace,
{
    SessionSpaces {
        processes: processes.into_iter(),
        space_of,
        seen: HashSet::new(),
        _marker: std::marker::PhantomData,
    }
}

/// Finds the session with the given `SessionId`.
pub fn find_session_space<'a, I, F>(processes: I, space_of: F, session_id: u64) -> Option<TypedObject<'a>>
where
    I: IntoIterator<Item = TypedObject<'a>>,
    F: FnMut(&TypedObject<'a>) -> &'a dyn AddressSpace,
{
    let found = session_spaces(processes, space_of)
        .find(|session| session.get("SessionId").as_u64() == Some(session_id));

    if found.is_none() {
        debug!("cannot locate session {}", session_id);
    }

    found
}

fn scalar(value: Value) -> Option<u64> {
    match value {
        Value::Unsigned(v) => Some(v),
        Value::Signed(v) => Some(v as u64),
        // _LARGE_INTEGER
        Value::Object(obj) => scalar(obj.get("QuadPart")),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub address: Address,
    pub pid: Option<u64>,
    pub name: Option<String>,
    pub create_time: Option<u64>,
}

impl ProcessEntry {
    fn from_process(process: &TypedObject) -> Self {
        Self {
            address: process.address(),
            pid: scalar(process.get("UniqueProcessId")),
            name: process.get("ImageFileName").to_string_lossy(),
            create_time: scalar(process.get("CreateTime")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionImage {
    pub address: Address,
    pub image_base: Option<Address>,
    pub name: Option<String>,
}

/// Summary of one session: its processes, paged pool and loaded images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub address: Address,
    pub session_id: Option<u64>,
    pub processes: Vec<ProcessEntry>,
    pub paged_pool_start: Option<Address>,
    pub paged_pool_end: Option<Address>,
    pub images: Vec<SessionImage>,
}

impl SessionInfo {
    pub fn collect(session: &TypedObject, resolver: &dyn AddressResolver) -> Self {
        let processes = match session.get("ProcessList").object() {
            Some(head) => head
                .list_of_type("_EPROCESS", "SessionProcessLinks")
                .map(|p| ProcessEntry::from_process(&p))
                .collect(),
            None => vec![],
        };

        let images = session
            .get("ImageIterator")
            .objects()
            .filter(|image| image.type_name() == IMAGE_ENTRY)
            .map(|image| {
                let image_base = image.get("ImageBase").address();
                SessionImage {
                    address: image.address(),
                    image_base,
                    name: image_base.and_then(|base| resolver.format_address(base)),
                }
            })
            .collect();

        Self {
            address: session.address(),
            session_id: scalar(session.get("SessionId")),
            processes,
            paged_pool_start: session.get("PagedPoolStart").address(),
            paged_pool_end: session.get("PagedPoolEnd").address(),
            images,
        }
    }
}

struct AddrPad(Option<Address>);

impl fmt::Display for AddrPad {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{:#014x}", addr.to_umem()),
            None => write!(f, "{:>14}", "-"),
        }
    }
}

fn or_dash<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Session(V): {} ID: {} Processes: {}",
            AddrPad(Some(self.address)),
            or_dash(&self.session_id),
            self.processes.len()
        )?;
        writeln!(
            f,
            "PagedPoolStart: {} PagedPoolEnd {}",
            AddrPad(self.paged_pool_start),
            AddrPad(self.paged_pool_end)
        )?;

        for process in &self.processes {
            writeln!(
                f,
                " Process: {} {} @ {}",
                or_dash(&process.pid),
                process.name.as_deref().unwrap_or("-"),
                or_dash(&process.create_time)
            )?;
        }

        for image in &self.images {
            writeln!(
                f,
                " Image: {}, Address {}, Name: {}",
                AddrPad(Some(image.address)),
                AddrPad(image.image_base),
                image.name.as_deref().unwrap_or("-")
            )?;
        }

        Ok(())
    }
}
