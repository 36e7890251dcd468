//! Identity registry.
//!
//! Maps endpoint names to the 16-bit ids used on the wire. Names seen for the
//! first time are given an id from the dynamic range
//! [`DYNAMIC_ID_MIN`]..=[`DYNAMIC_ID_MAX`], so they never collide with the
//! statically assigned ids devices report during discovery. Dynamic ids are
//! never recycled: once the range is used up, new names are refused.

use std::collections::HashMap;

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::EndpointRef;

/// Bidirectional name ⇄ id table owned by one connection.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
    next_dynamic: u16,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    /// Create a registry with the discovery service pre-bound.
    pub fn new() -> Self {
        let mut registry = IdentityRegistry {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_dynamic: DYNAMIC_ID_MIN,
        };
        registry.bind(DISCOVERY_SERVICE_NAME, DISCOVERY_SERVICE_ID);
        registry
    }

    /// Get the id for a name, allocating one from the dynamic range if the
    /// name has not been seen before.
    ///
    /// Fails with [`ProtocolError::IdentitiesExhausted`] when every dynamic
    /// id is taken.
    pub fn id_for(&mut self, name: &str) -> ProtocolResult<u16> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        let Some(id) = self.allocate() else {
            log::warn!("identity: dynamic id range exhausted, refusing {:?}", name);
            return Err(ProtocolError::IdentitiesExhausted(name.to_string()));
        };
        self.bind(name, id);
        log::debug!("identity: assigned 0x{:04X} to {:?}", id, name);
        Ok(id)
    }

    /// Get the name registered for an id, or the id itself if unregistered.
    pub fn name_for(&self, id: u16) -> EndpointRef {
        match self.by_id.get(&id) {
            Some(name) => EndpointRef::Name(name.clone()),
            None => EndpointRef::Id(id),
        }
    }

    /// Resolve an endpoint reference to a wire id.
    ///
    /// Numeric references pass through unchanged; names go through
    /// [`IdentityRegistry::id_for`].
    pub fn resolve(&mut self, endpoint: &EndpointRef) -> ProtocolResult<u16> {
        match endpoint {
            EndpointRef::Id(id) => Ok(*id),
            EndpointRef::Name(name) => self.id_for(name),
        }
    }

    /// Resolve an endpoint reference without allocating.
    pub fn lookup(&self, endpoint: &EndpointRef) -> Option<u16> {
        match endpoint {
            EndpointRef::Id(id) => Some(*id),
            EndpointRef::Name(name) => self.get(name),
        }
    }

    /// Record a statically known name for an id (e.g. learned in discovery).
    ///
    /// Replaces any previous mapping of either the name or the id so the two
    /// directions stay consistent.
    pub fn bind(&mut self, name: &str, id: u16) {
        if let Some(old_id) = self.by_name.insert(name.to_string(), id) {
            if old_id != id {
                self.by_id.remove(&old_id);
            }
        }
        if let Some(old_name) = self.by_id.insert(id, name.to_string()) {
            if old_name != name {
                self.by_name.remove(&old_name);
            }
        }
    }

    /// Look up an id without allocating.
    pub fn get(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the registry holds no names.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn allocate(&mut self) -> Option<u16> {
        let span = (DYNAMIC_ID_MAX - DYNAMIC_ID_MIN) as u32 + 1;
        for _ in 0..span {
            let candidate = self.advance();
            if !self.by_id.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn advance(&mut self) -> u16 {
        let id = self.next_dynamic;
        self.next_dynamic = if id == DYNAMIC_ID_MAX {
            DYNAMIC_ID_MIN
        } else {
            id + 1
        };
        id
    }
}
