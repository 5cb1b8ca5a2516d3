use crate::object::{TypedObject, Value};
use crate::profile::Profile;
use crate::space::AddressSpace;

use memflow::prelude::v1::*;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use log::*;

/// Pre-order walk of the task hierarchy through `children` and `sibling`.
///
/// Yields every task together with its depth below the root.
#[derive(Clone)]
pub struct TaskTree<'a> {
    stack: Vec<(TypedObject<'a>, usize)>,
    visited: HashSet<umem>,
    max_depth: usize,
}

impl<'a> TaskTree<'a> {
    pub fn new(root: TypedObject<'a>) -> Self {
        Self {
            stack: vec![(root, 0)],
            visited: HashSet::new(),
            max_depth: root.profile().walk_config().max_tree_depth,
        }
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn children(task: &TypedObject<'a>) -> Vec<TypedObject<'a>> {
        match task.get("children").object() {
            Some(head) => head.list_of_type("task_struct", "sibling").collect(),
            None => vec![],
        }
    }
}

impl<'a> Iterator for TaskTree<'a> {
    type Item = (TypedObject<'a>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (task, depth) = self.stack.pop()?;

            if !self.visited.insert(task.address().to_umem()) {
                warn!("task 0x{:x} seen twice, skipping its subtree", task.address());
                continue;
            }

            if depth < self.max_depth {
                let children = Self::children(&task);
                self.stack
                    .extend(children.into_iter().rev().map(|child| (child, depth + 1)));
            } else {
                warn!(
                    "task 0x{:x} is deeper than {}, not descending",
                    task.address(),
                    self.max_depth
                );
            }

            return Some((task, depth));
        }
    }
}

/// Column the process tree is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Pid,
    Ppid,
    Uid,
    Depth,
    Name,
}

impl SortOrder {
    /// Column by position: pid, ppid, uid, depth, name.
    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(SortOrder::Pid),
            1 => Some(SortOrder::Ppid),
            2 => Some(SortOrder::Uid),
            3 => Some(SortOrder::Depth),
            4 => Some(SortOrder::Name),
            _ => None,
        }
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Pid
    }
}

#[derive(Clone)]
pub struct PsTreeRow<'a> {
    pub pid: Option<i64>,
    pub ppid: Option<i64>,
    pub uid: Option<u64>,
    pub depth: usize,
    pub name: Option<String>,
    pub task: TypedObject<'a>,
}

impl<'a> PsTreeRow<'a> {
    pub fn from_task(task: TypedObject<'a>, depth: usize) -> Self {
        let parent = match task.get("real_parent") {
            Value::Object(parent) => Value::Object(parent),
            _ => task.get("parent"),
        };

        Self {
            pid: task.get("pid").as_i64(),
            ppid: parent.get("pid").as_i64(),
            uid: task.get("uid").as_u64(),
            depth,
            name: task.get("name").as_str().map(str::to_string),
            task,
        }
    }

    fn columns(&self) -> [Option<String>; 5] {
        [
            self.pid.map(|v| v.to_string()),
            self.ppid.map(|v| v.to_string()),
            self.uid.map(|v| v.to_string()),
            Some(".".repeat(self.depth)).filter(|d| !d.is_empty()),
            self.name.clone(),
        ]
    }

    /// Whether any column contains `search`.
    pub fn matches(&self, search: &str) -> bool {
        self.columns()
            .iter()
            .flatten()
            .any(|col| col.contains(search))
    }

    fn compare(&self, other: &Self, order: SortOrder) -> Ordering {
        let column = match order {
            SortOrder::Pid => self.pid.cmp(&other.pid),
            SortOrder::Ppid => self.ppid.cmp(&other.ppid),
            SortOrder::Uid => self.uid.cmp(&other.uid),
            SortOrder::Depth => self.depth.cmp(&other.depth),
            SortOrder::Name => self.name.cmp(&other.name),
        };
        column.then_with(|| self.pid.cmp(&other.pid))
    }
}

fn dash<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for PsTreeRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:>6} {:>6} {:>6} {}{}",
            dash(&self.pid),
            dash(&self.ppid),
            dash(&self.uid),
            ".".repeat(self.depth),
            self.name.as_deref().unwrap_or("-")
        )
    }
}

impl fmt::Debug for PsTreeRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:?})", self, self.task)
    }
}

/// Parent/child process listing starting at `init_task`.
#[derive(Debug, Clone, Default)]
pub struct PsTree {
    pub sort_order: SortOrder,
    pub search: Option<String>,
}

impl PsTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort_order(mut self, sort_order: SortOrder) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn search(mut self, search: &str) -> Self {
        self.search = Some(search.to_string());
        self
    }

    /// Walks the tree below `init_task` and returns the sorted and filtered rows.
    pub fn rows<'a>(&self, profile: &'a Profile, space: &'a dyn AddressSpace) -> Result<Vec<PsTreeRow<'a>>> {
        let root = profile
            .constant_object("init_task", "task_struct", space)
            .object()
            .ok_or_else(|| {
                Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
                    .log_error("profile has no init_task task_struct")
            })?;

        let mut rows = TaskTree::new(root)
            .map(|(task, depth)| PsTreeRow::from_task(task, depth))
            .collect::<Vec<_>>();

        rows.sort_by(|a, b| a.compare(b, self.sort_order));

        if let Some(search) = &self.search {
            rows.retain(|row| row.matches(search));
        }

        info!("pstree: {} tasks", rows.len());

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linux::initialize;
    use crate::profile::{Catalog, FieldKind, Primitive, ProfileBuilder, TypeLayout};
    use crate::space::SparseSpace;

    const TASK_SIZE: u64 = 0x60;

    fn profile(init_task: u64) -> Profile {
        initialize(
            ProfileBuilder::new()
                .metadata("os", "linux")
                .base_catalog(
                    Catalog::new()
                        .with_type(
                            TypeLayout::new("list_head", 0x10)
                                .with_field("next", 0, FieldKind::pointer("list_head"))
                                .with_field("prev", 8, FieldKind::pointer("list_head")),
                        )
                        .with_type(
                            TypeLayout::new("task_struct", TASK_SIZE as usize)
                                .with_field("pid", 0, Primitive::I32)
                                .with_field("uid", 4, Primitive::U32)
                                .with_field("real_parent", 8, FieldKind::pointer("task_struct"))
                                .with_field("children", 0x10, FieldKind::structure("list_head"))
                                .with_field("sibling", 0x20, FieldKind::structure("list_head"))
                                .with_field("comm", 0x30, FieldKind::string(16)),
                        ),
                )
                .constant("init_task", Address::from(init_task)),
        )
        .build()
        .unwrap()
    }

    struct Task {
        pid: i32,
        uid: u32,
        name: &'static str,
        parent: usize,
        children: Vec<usize>,
    }

    fn addr(idx: usize) -> u64 {
        0x1000 + idx as u64 * 0x100
    }

    /// Lays out `tasks` at `addr(i)`, linking their children and sibling lists.
    fn memory(tasks: &[Task]) -> SparseSpace {
        let mut buf = vec![0u8; tasks.len() * 0x100];
        let mut put = |at: u64, bytes: &[u8]| {
            let off = (at - 0x1000) as usize;
            buf[off..off + bytes.len()].copy_from_slice(bytes);
        };

        for (i, task) in tasks.iter().enumerate() {
            let base = addr(i);
            put(base, &task.pid.to_le_bytes());
            put(base + 4, &task.uid.to_le_bytes());
            put(base + 8, &addr(task.parent).to_le_bytes());
            put(base + 0x30, task.name.as_bytes());

            // children list: head at +0x10, entries are the children's sibling nodes
            let mut nodes = vec![base + 0x10];
            nodes.extend(task.children.iter().map(|&c| addr(c) + 0x20));
            for (n, &node) in nodes.iter().enumerate() {
                let next = nodes[(n + 1) % nodes.len()];
                let prev = nodes[(n + nodes.len() - 1) % nodes.len()];
                put(node, &next.to_le_bytes());
                put(node + 8, &prev.to_le_bytes());
            }
        }

        SparseSpace::new()
            .with_range(Address::from(0x1000u64), buf)
            .unwrap()
    }

    fn tasks() -> Vec<Task> {
        vec![
            Task { pid: 0, uid: 0, name: "swapper", parent: 0, children: vec![1, 2] },
            Task { pid: 1, uid: 0, name: "systemd", parent: 0, children: vec![3, 4] },
            Task { pid: 2, uid: 0, name: "kthreadd", parent: 0, children: vec![] },
            Task { pid: 412, uid: 1000, name: "bash", parent: 1, children: vec![] },
            Task { pid: 300, uid: 101, name: "dbus-daemon", parent: 1, children: vec![] },
        ]
    }

    #[test]
    fn task_tree_is_pre_order() {
        let space = memory(&tasks());
        let profile = profile(addr(0));
        let root = profile
            .instantiate("task_struct", addr(0).into(), &space)
            .unwrap();

        let walk = TaskTree::new(root)
            .map(|(task, depth)| (task.get("pid").as_i64().unwrap(), depth))
            .collect::<Vec<_>>();
        assert_eq!(walk, vec![(0, 0), (1, 1), (412, 2), (300, 2), (2, 1)]);

        let shallow = TaskTree::new(root).max_depth(1).count();
        assert_eq!(shallow, 3);
    }

    #[test]
    fn rows_sorted_by_pid() {
        let space = memory(&tasks());
        let profile = profile(addr(0));

        let rows = PsTree::new().rows(&profile, &space).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.pid.unwrap()).collect::<Vec<_>>(),
            vec![0, 1, 2, 300, 412]
        );

        let bash = &rows[4];
        assert_eq!(bash.ppid, Some(1));
        assert_eq!(bash.uid, Some(1000));
        assert_eq!(bash.depth, 2);
        assert_eq!(bash.name.as_deref(), Some("bash"));
        assert_eq!(bash.to_string(), "   412      1   1000 ..bash");
    }

    #[test]
    fn rows_sorted_by_column_with_pid_tiebreak() {
        let space = memory(&tasks());
        let profile = profile(addr(0));

        let rows = PsTree::new()
            .sort_order(SortOrder::Depth)
            .rows(&profile, &space)
            .unwrap();
        assert_eq!(
            rows.iter().map(|r| r.pid.unwrap()).collect::<Vec<_>>(),
            vec![0, 1, 2, 300, 412]
        );

        let rows = PsTree::new()
            .sort_order(SortOrder::Name)
            .rows(&profile, &space)
            .unwrap();
        assert_eq!(
            rows.iter().map(|r| r.name.clone().unwrap()).collect::<Vec<_>>(),
            vec!["bash", "dbus-daemon", "kthreadd", "swapper", "systemd"]
        );
    }

    #[test]
    fn search_filters_rows() {
        let space = memory(&tasks());
        let profile = profile(addr(0));

        let rows = PsTree::new().search("1000").rows(&profile, &space).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, Some(412));

        let rows = PsTree::new().search("..").rows(&profile, &space).unwrap();
        assert_eq!(rows.len(), 2);

        let rows = PsTree::new().search("nothing").rows(&profile, &space).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn cyclic_children_terminate() {
        let mut tasks = tasks();
        // bash claims init as its child
        tasks[3].children = vec![0];
        let space = memory(&tasks);
        let profile = profile(addr(0));

        let rows = PsTree::new().rows(&profile, &space).unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn missing_init_task() {
        let space = memory(&tasks());
        let profile = ProfileBuilder::new().build().unwrap();

        assert!(PsTree::new().rows(&profile, &space).is_err());
        assert_eq!(SortOrder::from_index(4), Some(SortOrder::Name));
        assert_eq!(SortOrder::from_index(5), None);
    }
}
