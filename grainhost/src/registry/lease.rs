//! RAII use of a grain container.

use super::RegistryInner;
use crate::container::ContainerStarter;
use crate::runtime::types::{GrainId, InstanceId};
use std::ops::Deref;
use std::sync::Arc;

/// One counted use of a grain's container, released on drop.
///
/// A lease that outlives its container instance (the grain was stopped and
/// started again meanwhile) releases nothing on the newer instance.
pub struct ContainerLease<S: ContainerStarter> {
    registry: Arc<RegistryInner<S>>,
    grain_id: GrainId,
    instance_id: InstanceId,
    container: Arc<S::Container>,
}

impl<S: ContainerStarter> ContainerLease<S> {
    pub(super) fn new(
        registry: Arc<RegistryInner<S>>,
        grain_id: GrainId,
        instance_id: InstanceId,
        container: Arc<S::Container>,
    ) -> Self {
        Self {
            registry,
            grain_id,
            instance_id,
            container,
        }
    }

    pub fn grain_id(&self) -> &str {
        &self.grain_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn container(&self) -> &Arc<S::Container> {
        &self.container
    }
}

impl<S: ContainerStarter> Deref for ContainerLease<S> {
    type Target = S::Container;

    fn deref(&self) -> &Self::Target {
        &self.container
    }
}

impl<S: ContainerStarter> Drop for ContainerLease<S> {
    fn drop(&mut self) {
        self.registry
            .release_instance(&self.grain_id, self.instance_id);
    }
}

impl<S: ContainerStarter> std::fmt::Debug for ContainerLease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLease")
            .field("grain_id", &self.grain_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}
