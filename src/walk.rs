/*!
Lazy traversal of linked lists and binary trees found in memory.

Every walker is a plain iterator over [`TypedObject`]s. Walks are bounded by the limits of a
[`WalkConfig`], so corrupted containers end the sequence early instead of looping forever.
*/

use crate::object::TypedObject;
use crate::profile::{FieldKind, TypeLayout};

use memflow::prelude::v1::*;

use std::collections::HashSet;

use log::*;

use serde::{Deserialize, Serialize};

/// Upper bounds applied to container walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    pub max_list_entries: usize,
    pub max_tree_depth: usize,
    pub max_tree_nodes: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_list_entries: 65536,
            max_tree_depth: 128,
            max_tree_nodes: 65536,
        }
    }
}

/// Reads a link field of `node` and returns the non-null address it points to.
///
/// Only pointers and plain integers are links. Following an inline structure would step by
/// its offset forever, so any other field kind ends the walk.
fn follow(node: &TypedObject, field: &str) -> Option<Address> {
    match node.layout().field(field).map(|f| &f.kind) {
        Some(FieldKind::Pointer { .. }) | Some(FieldKind::Primitive(_)) => {}
        Some(kind) => {
            warn!(
                "{}.{} is not a pointer ({:?}), can not follow it",
                node.type_name(),
                field,
                kind
            );
            return None;
        }
        None => {
            trace!("{} has no link field {}", node.type_name(), field);
            return None;
        }
    }

    node.get(field)
        .as_u64()
        .filter(|&addr| addr != 0)
        .map(Address::from)
}

fn lookup_element<'a>(anchor: &TypedObject<'a>, element_type: &str) -> Option<&'a TypeLayout> {
    match anchor.profile().lookup_type(element_type) {
        Ok(layout) => Some(layout),
        Err(_) => {
            warn!("unknown element type {}", element_type);
            None
        }
    }
}

/// Linked list walk starting at an anchor node.
///
/// The walk follows `link` from node to node. It ends when the link returns to the anchor,
/// when it is null or unreadable, when a node repeats, or after the configured maximum number
/// of entries. Each visited node is yielded as the element type found `adjustment` bytes
/// before the node.
#[derive(Clone)]
pub struct ListWalk<'a> {
    anchor: TypedObject<'a>,
    link: String,
    element: Option<&'a TypeLayout>,
    adjustment: usize,
    include_anchor: bool,
    max_entries: usize,

    current: Address,
    anchor_done: bool,
    visited: HashSet<umem>,
    yielded: usize,
    done: bool,
}

impl<'a> ListWalk<'a> {
    pub fn new(anchor: TypedObject<'a>, link: &str, element_type: &str) -> Self {
        let element = lookup_element(&anchor, element_type);
        let mut walk = Self::empty(anchor, link);
        walk.element = element;
        walk.done = element.is_none();
        walk
    }

    /// A walk that yields nothing.
    pub fn empty(anchor: TypedObject<'a>, link: &str) -> Self {
        let mut visited = HashSet::new();
        visited.insert(anchor.address().to_umem());

        Self {
            anchor,
            link: link.to_string(),
            element: None,
            adjustment: 0,
            include_anchor: false,
            max_entries: anchor.profile().walk_config().max_list_entries,

            current: anchor.address(),
            anchor_done: false,
            visited,
            yielded: 0,
            done: true,
        }
    }

    /// Offset of the link node inside the element.
    pub fn adjustment(mut self, adjustment: usize) -> Self {
        self.adjustment = adjustment;
        self
    }

    pub fn include_anchor(mut self, include_anchor: bool) -> Self {
        self.include_anchor = include_anchor;
        self
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_config(self, config: &WalkConfig) -> Self {
        self.max_entries(config.max_list_entries)
    }

    pub fn anchor(&self) -> TypedObject<'a> {
        self.anchor
    }

    /// A fresh walk over the same list.
    pub fn restart(&self) -> Self {
        let mut walk = Self::empty(self.anchor, &self.link);
        walk.element = self.element;
        walk.adjustment = self.adjustment;
        walk.include_anchor = self.include_anchor;
        walk.max_entries = self.max_entries;
        walk.done = self.element.is_none();
        walk
    }

    fn element_at(&self, layout: &'a TypeLayout, node: Address) -> TypedObject<'a> {
        TypedObject::new(
            self.anchor.profile(),
            layout,
            node.wrapping_sub(Address::from(self.adjustment)),
            self.anchor.space(),
        )
    }
}

impl<'a> Iterator for ListWalk<'a> {
    type Item = TypedObject<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let layout = self.element?;

        if self.yielded >= self.max_entries {
            warn!(
                "list at 0x{:x} exceeds {} entries, stopping",
                self.anchor.address(),
                self.max_entries
            );
            self.done = true;
            return None;
        }

        if self.include_anchor && !self.anchor_done {
            self.anchor_done = true;
            self.yielded += 1;
            return Some(self.element_at(layout, self.anchor.address()));
        }

        let node = self.anchor.at(self.current);
        let next = match follow(&node, &self.link) {
            Some(next) => next,
            None => {
                trace!("list at 0x{:x} ends at 0x{:x}", self.anchor.address(), self.current);
                self.done = true;
                return None;
            }
        };

        if next == self.anchor.address() {
            self.done = true;
            return None;
        }

        if !self.visited.insert(next.to_umem()) {
            warn!(
                "list at 0x{:x} revisits 0x{:x}, stopping",
                self.anchor.address(),
                next
            );
            self.done = true;
            return None;
        }

        trace!("list hop 0x{:x} -> 0x{:x}", self.current, next);

        self.current = next;
        self.yielded += 1;
        Some(self.element_at(layout, next))
    }
}

/// In-order walk of a binary tree.
///
/// Null or unreadable children end their branch. The walk stops when a node is seen twice,
/// when the tree gets deeper than the depth limit or after the node limit.
#[derive(Clone)]
pub struct TreeWalk<'a> {
    root: TypedObject<'a>,
    left: String,
    right: String,
    element: Option<&'a TypeLayout>,
    adjustment: usize,
    max_depth: usize,
    max_nodes: usize,

    stack: Vec<(Address, usize)>,
    pending: Option<(Address, usize)>,
    visited: HashSet<umem>,
    yielded: usize,
    done: bool,
}

impl<'a> TreeWalk<'a> {
    pub fn new(root: TypedObject<'a>, left: &str, right: &str, element_type: &str) -> Self {
        let element = lookup_element(&root, element_type);
        let config = root.profile().walk_config();

        Self {
            root,
            left: left.to_string(),
            right: right.to_string(),
            element,
            adjustment: 0,
            max_depth: config.max_tree_depth,
            max_nodes: config.max_tree_nodes,

            stack: vec![],
            pending: Some((root.address(), 0)).filter(|(addr, _)| !addr.is_null()),
            visited: HashSet::new(),
            yielded: 0,
            done: element.is_none(),
        }
    }

    /// Offset of the tree node inside the element.
    pub fn adjustment(mut self, adjustment: usize) -> Self {
        self.adjustment = adjustment;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_config(self, config: &WalkConfig) -> Self {
        self.max_depth(config.max_tree_depth)
            .max_nodes(config.max_tree_nodes)
    }

    pub fn root(&self) -> TypedObject<'a> {
        self.root
    }

    fn child(&self, node: Address, field: &str) -> Option<Address> {
        follow(&self.root.at(node), field)
    }

    fn stop(&mut self) -> Option<TypedObject<'a>> {
        self.done = true;
        self.stack.clear();
        self.pending = None;
        None
    }
}

impl<'a> Iterator for TreeWalk<'a> {
    type Item = TypedObject<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let layout = self.element?;

        while let Some((node, depth)) = self.pending.take() {
            if depth >= self.max_depth {
                warn!(
                    "tree at 0x{:x} deeper than {}, stopping",
                    self.root.address(),
                    self.max_depth
                );
                return self.stop();
            }

            if !self.visited.insert(node.to_umem()) {
                warn!(
                    "tree at 0x{:x} revisits 0x{:x}, stopping",
                    self.root.address(),
                    node
                );
                return self.stop();
            }

            trace!("tree descend 0x{:x} depth {}", node, depth);

            self.stack.push((node, depth));
            self.pending = self.child(node, &self.left).map(|c| (c, depth + 1));
        }

        let (node, depth) = match self.stack.pop() {
            Some(entry) => entry,
            None => return self.stop(),
        };

        if self.yielded >= self.max_nodes {
            warn!(
                "tree at 0x{:x} exceeds {} nodes, stopping",
                self.root.address(),
                self.max_nodes
            );
            return self.stop();
        }

        self.pending = self.child(node, &self.right).map(|c| (c, depth + 1));
        self.yielded += 1;

        Some(TypedObject::new(
            self.root.profile(),
            layout,
            node.wrapping_sub(Address::from(self.adjustment)),
            self.root.space(),
        ))
    }
}

/// A container walk held inside a [`Value`](crate::object::Value).
#[derive(Clone)]
pub enum Sequence<'a> {
    List(ListWalk<'a>),
    Tree(TreeWalk<'a>),
}

impl<'a> Iterator for Sequence<'a> {
    type Item = TypedObject<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Sequence::List(walk) => walk.next(),
            Sequence::Tree(walk) => walk.next(),
        }
    }
}

impl<'a> From<ListWalk<'a>> for Sequence<'a> {
    fn from(walk: ListWalk<'a>) -> Self {
        Sequence::List(walk)
    }
}

impl<'a> From<TreeWalk<'a>> for Sequence<'a> {
    fn from(walk: TreeWalk<'a>) -> Self {
        Sequence::Tree(walk)
    }
}

/// Walks the list linked through `link_field` starting at `anchor`.
///
/// The anchor itself is only part of the output if `include_anchor` is set.
pub fn walk_linked_list<'a>(
    anchor: TypedObject<'a>,
    link_field: &str,
    element_type: &str,
    include_anchor: bool,
) -> ListWalk<'a> {
    ListWalk::new(anchor, link_field, element_type).include_anchor(include_anchor)
}

/// Walks the tree below `root` in order: left subtree, node, right subtree.
pub fn walk_tree_inorder<'a>(
    root: TypedObject<'a>,
    left_field: &str,
    right_field: &str,
    element_type: &str,
    node_offset_adjustment: usize,
) -> TreeWalk<'a> {
    TreeWalk::new(root, left_field, right_field, element_type).adjustment(node_offset_adjustment)
}
