// Copyright (c) 2025 - Cowboy AI, LLC.

//! Bidirectional id ↔ name registry
//!
//! Used for CAs, profiles, publishers and requestors. Names are compared
//! case-insensitively and stored normalised to lowercase; ids and names
//! each have a unique inverse.

use std::collections::HashMap;

use crate::types::NameId;
use crate::{CaError, Result};

/// Bidirectional registry of [`NameId`] pairs
#[derive(Debug, Default, Clone)]
pub struct NameIdRegistry {
    by_id: HashMap<u32, NameId>,
    by_name: HashMap<String, u32>,
}

impl NameIdRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair; fails with `DuplicateName` or `DuplicateId`
    pub fn add(&mut self, id: u32, name: &str) -> Result<NameId> {
        let entry = NameId::new(id, name)?;
        if self.by_name.contains_key(&entry.name) {
            return Err(CaError::DuplicateName(entry.name));
        }
        if self.by_id.contains_key(&entry.id) {
            return Err(CaError::DuplicateId(format!("{}", entry.id)));
        }
        self.by_name.insert(entry.name.clone(), entry.id);
        self.by_id.insert(entry.id, entry.clone());
        Ok(entry)
    }

    /// Remove by id, returning the removed pair if present
    pub fn remove_id(&mut self, id: u32) -> Option<NameId> {
        let entry = self.by_id.remove(&id)?;
        self.by_name.remove(&entry.name);
        Some(entry)
    }

    /// Look up the id of a name (case-insensitive)
    pub fn name_to_id(&self, name: &str) -> Option<u32> {
        self.by_name.get(&name.trim().to_lowercase()).copied()
    }

    /// Look up the name of an id
    pub fn id_to_name(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(|e| e.name.as_str())
    }

    /// Full pair for a name
    pub fn get_by_name(&self, name: &str) -> Option<&NameId> {
        self.name_to_id(name).and_then(|id| self.by_id.get(&id))
    }

    /// Full pair for an id
    pub fn get_by_id(&self, id: u32) -> Option<&NameId> {
        self.by_id.get(&id)
    }

    /// All registered pairs, unordered
    pub fn entries(&self) -> impl Iterator<Item = &NameId> {
        self.by_id.values()
    }

    /// Number of registered pairs
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
