use super::layout::{ComputedFn, FieldDescriptor, FieldKind, TypeLayout};

use memflow::prelude::v1::*;

use std::collections::HashMap;

use log::*;

/// Complete layouts installed as the starting point of a profile.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    types: Vec<TypeLayout>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, layout: TypeLayout) -> Self {
        self.insert(layout);
        self
    }

    pub fn insert(&mut self, layout: TypeLayout) {
        match self.types.iter_mut().find(|t| t.name() == layout.name()) {
            Some(t) => *t = layout,
            None => self.types.push(layout),
        }
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeLayout> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub(crate) fn install(&self, types: &mut HashMap<String, TypeLayout>) {
        for layout in &self.types {
            types.insert(layout.name().to_string(), layout.clone());
        }
    }

    /// Turns a fully specified overlay into a catalog.
    ///
    /// Every type needs a size and every field an offset.
    pub fn from_overlay(overlay: &Overlay) -> Result<Self> {
        let mut catalog = Catalog::new();

        for (name, patch) in &overlay.types {
            let size = patch.size.ok_or_else(|| {
                Error(ErrorOrigin::OsLayer, ErrorKind::Offset)
                    .log_error(format!("type {} has no size", name))
            })?;

            let mut layout = TypeLayout::new(name, size);
            for field in &patch.fields {
                let offset = match (field.offset, &field.kind) {
                    (Some(offset), _) => offset,
                    (None, FieldKind::Computed(_)) => 0,
                    (None, _) => {
                        return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Offset)
                            .log_error(format!("field {}.{} has no offset", name, field.name)))
                    }
                };
                layout.set_field(
                    &field.name,
                    FieldDescriptor {
                        offset,
                        kind: field.kind.clone(),
                    },
                );
            }

            catalog.insert(layout);
        }

        Ok(catalog)
    }
}

#[derive(Clone, Debug)]
pub struct FieldPatch {
    pub name: String,
    /// `None` keeps the offset the field already has.
    pub offset: Option<usize>,
    pub kind: FieldKind,
}

#[derive(Clone, Debug, Default)]
pub struct TypePatch {
    /// `None` keeps the current size.
    pub size: Option<usize>,
    pub fields: Vec<FieldPatch>,
}

/// Partial layout update merged onto an existing set of types.
///
/// Fields named in the overlay replace the fields of the same name, everything else is
/// inherited unchanged.
#[derive(Clone, Debug)]
pub struct Overlay {
    name: String,
    types: Vec<(String, TypePatch)>,
}

impl Overlay {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            types: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patches(&self) -> impl Iterator<Item = (&str, &TypePatch)> {
        self.types.iter().map(|(n, p)| (n.as_str(), p))
    }

    fn patch_mut(&mut self, type_name: &str) -> &mut TypePatch {
        let idx = match self.types.iter().position(|(n, _)| n == type_name) {
            Some(idx) => idx,
            None => {
                self.types.push((type_name.to_string(), TypePatch::default()));
                self.types.len() - 1
            }
        };
        &mut self.types[idx].1
    }

    fn push_field(mut self, type_name: &str, field: FieldPatch) -> Self {
        let patch = self.patch_mut(type_name);
        match patch.fields.iter_mut().find(|f| f.name == field.name) {
            Some(f) => *f = field,
            None => patch.fields.push(field),
        }
        self
    }

    pub fn size(mut self, type_name: &str, size: usize) -> Self {
        self.patch_mut(type_name).size = Some(size);
        self
    }

    pub fn field(self, type_name: &str, field: &str, offset: usize, kind: impl Into<FieldKind>) -> Self {
        self.push_field(
            type_name,
            FieldPatch {
                name: field.to_string(),
                offset: Some(offset),
                kind: kind.into(),
            },
        )
    }

    /// Changes the type of an existing field, keeping its offset.
    pub fn retype(self, type_name: &str, field: &str, kind: impl Into<FieldKind>) -> Self {
        self.push_field(
            type_name,
            FieldPatch {
                name: field.to_string(),
                offset: None,
                kind: kind.into(),
            },
        )
    }

    pub fn computed(self, type_name: &str, field: &str, func: ComputedFn) -> Self {
        self.push_field(
            type_name,
            FieldPatch {
                name: field.to_string(),
                offset: None,
                kind: FieldKind::Computed(func),
            },
        )
    }

    pub(crate) fn push_patch(&mut self, type_name: &str, patch: TypePatch) {
        let target = self.patch_mut(type_name);
        if patch.size.is_some() {
            target.size = patch.size;
        }
        for field in patch.fields {
            match target.fields.iter_mut().find(|f| f.name == field.name) {
                Some(f) => *f = field,
                None => target.fields.push(field),
            }
        }
    }

    /// Merges the overlay into `types`, last writer wins per field.
    pub(crate) fn apply(&self, types: &mut HashMap<String, TypeLayout>) -> Result<()> {
        for (type_name, patch) in &self.types {
            if !types.contains_key(type_name) {
                let size = match patch.size {
                    Some(size) => size,
                    None if patch.fields.iter().all(|f| f.kind.is_computed()) => 0,
                    None => {
                        return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Offset).log_error(
                            format!(
                                "overlay {} introduces type {} without a size",
                                self.name, type_name
                            ),
                        ))
                    }
                };
                debug!("overlay {} adds type {}", self.name, type_name);
                types.insert(type_name.clone(), TypeLayout::new(type_name, size));
            }

            let layout = types
                .get_mut(type_name)
                .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))?;

            if let Some(size) = patch.size {
                layout.set_size(size);
            }

            for field in &patch.fields {
                let offset = match (field.offset, layout.field(&field.name), &field.kind) {
                    (Some(offset), _, _) => offset,
                    (None, Some(existing), _) => existing.offset,
                    (None, None, FieldKind::Computed(_)) => 0,
                    (None, None, _) => {
                        return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Offset).log_error(
                            format!(
                                "overlay {} retypes {}.{} which has no offset to inherit",
                                self.name, type_name, field.name
                            ),
                        ))
                    }
                };

                trace!(
                    "overlay {}: {}.{} @ {:#x} {:?}",
                    self.name,
                    type_name,
                    field.name,
                    offset,
                    field.kind
                );

                layout.set_field(
                    &field.name,
                    FieldDescriptor {
                        offset,
                        kind: field.kind.clone(),
                    },
                );
            }
        }

        Ok(())
    }
}
