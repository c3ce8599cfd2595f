use std::collections::HashMap;

use tracing::debug;

use crate::{
    endpoint::{EndpointId, Resource},
    error::Error,
};

/// Live endpoints keyed by engine handle.
///
/// Purged endpoints leave a tombstone holding the error they closed with, so work that was
/// queued before the close can be completed with the cause instead of `UnknownResource`.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    resources: HashMap<EndpointId, Resource>,
    tombstones: HashMap<EndpointId, Error>,
}

impl Registry {
    /// Fails with the resource given back if the handle is already live
    pub fn insert(&mut self, resource: Resource) -> Result<(), Resource> {
        let id = resource.id();
        if self.resources.contains_key(&id) {
            return Err(resource);
        }
        self.tombstones.remove(&id);
        if let Some(parent) = resource.parent().and_then(|p| self.resources.get_mut(&p)) {
            parent.add_child(id);
        }
        self.resources.insert(id, resource);
        Ok(())
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn get_mut(&mut self, id: &EndpointId) -> Option<&mut Resource> {
        self.resources.get_mut(id)
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.resources.contains_key(id)
    }

    /// Handles of every endpoint without a parent
    pub fn roots(&self) -> Vec<EndpointId> {
        let mut roots: Vec<_> = self
            .resources
            .values()
            .filter(|r| r.parent().is_none())
            .map(Resource::id)
            .collect();
        roots.sort();
        roots
    }

    pub fn remove(&mut self, id: &EndpointId) -> Option<Resource> {
        let resource = self.resources.remove(id)?;
        if let Some(parent) = resource.parent().and_then(|p| self.resources.get_mut(&p)) {
            parent.remove_child(id);
        }
        if let Some(cause) = resource.closed_with() {
            self.tombstones.insert(*id, cause.clone());
        }
        debug!(endpoint = %id, "removed from registry");
        Some(resource)
    }

    /// The error a command targeting a missing handle completes with
    pub fn lookup_error(&self, id: &EndpointId) -> Error {
        self.tombstones
            .get(id)
            .cloned()
            .unwrap_or(Error::UnknownResource(*id))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        endpoint::{EndpointId, Resource, ResourceKind, Role},
        error::{Error, ErrorKind},
    };

    use super::Registry;

    fn remote(id: u32, kind: ResourceKind, parent: Option<u32>) -> Resource {
        Resource::remote(EndpointId(id), kind, parent.map(EndpointId))
    }

    #[test]
    fn insert_links_child_to_parent() {
        let mut registry = Registry::default();
        registry
            .insert(remote(0, ResourceKind::Connection, None))
            .unwrap();
        registry
            .insert(remote(1, ResourceKind::Session, Some(0)))
            .unwrap();

        let connection = registry.get(&EndpointId(0)).unwrap();
        assert_eq!(connection.snapshot().children, vec![EndpointId(1)]);
        assert_eq!(registry.roots(), vec![EndpointId(0)]);
    }

    #[test]
    fn duplicate_handle_is_rejected() {
        let mut registry = Registry::default();
        registry
            .insert(remote(0, ResourceKind::Connection, None))
            .unwrap();
        assert!(registry
            .insert(remote(0, ResourceKind::Connection, None))
            .is_err());
        assert_eq!(registry.roots(), vec![EndpointId(0)]);
    }

    #[test]
    fn removal_unlinks_and_leaves_tombstone() {
        let mut registry = Registry::default();
        registry
            .insert(remote(0, ResourceKind::Connection, None))
            .unwrap();
        registry
            .insert(remote(1, ResourceKind::Session, Some(0)))
            .unwrap();
        registry
            .insert(remote(2, ResourceKind::Link(Role::Sender), Some(1)))
            .unwrap();

        let cause = Error::remotely_closed(ResourceKind::Connection, EndpointId(0), None);
        registry
            .get_mut(&EndpointId(2))
            .unwrap()
            .force_close(cause.clone());
        registry.remove(&EndpointId(2)).unwrap();

        assert!(!registry.contains(&EndpointId(2)));
        let session = registry.get(&EndpointId(1)).unwrap();
        assert!(session.snapshot().children.is_empty());
        assert_eq!(registry.lookup_error(&EndpointId(2)), cause);
        assert_eq!(
            registry.lookup_error(&EndpointId(9)).kind(),
            ErrorKind::UnknownResource
        );

        registry
            .insert(remote(2, ResourceKind::Link(Role::Sender), Some(1)))
            .unwrap();
        registry.remove(&EndpointId(2));
        assert_eq!(
            registry.lookup_error(&EndpointId(2)).kind(),
            ErrorKind::UnknownResource
        );
    }
}
