//! Session: the media instances sharing one UI surface.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use common::{EngineError, EngineResult};
use flinger_media::{HostAdapter, InstanceSettings, MediaInstance};

/// A host surface and its media instances.
pub struct Session {
    id: String,
    /// Receives frames and state changes of every instance.
    adapter: Arc<dyn HostAdapter>,
    settings: Arc<InstanceSettings>,
    max_instances: usize,
    instances: RwLock<HashMap<String, Arc<MediaInstance>>>,
    /// Instance whose frames the session's render target shows.
    active_instance: RwLock<Option<String>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        adapter: Arc<dyn HostAdapter>,
        settings: Arc<InstanceSettings>,
        max_instances: usize,
    ) -> Self {
        Self {
            id: id.into(),
            adapter,
            settings,
            max_instances,
            instances: RwLock::new(HashMap::new()),
            active_instance: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter(&self) -> Arc<dyn HostAdapter> {
        Arc::clone(&self.adapter)
    }

    /// Look up an instance.
    pub fn instance(&self, instance_id: &str) -> EngineResult<Arc<MediaInstance>> {
        self.instances
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::not_found(format!(
                    "instance '{}' in session '{}'",
                    instance_id, self.id
                ))
            })
    }

    /// Look up an instance, creating it on first reference.
    pub fn get_or_create_instance(&self, instance_id: &str) -> EngineResult<Arc<MediaInstance>> {
        if let Some(instance) = self.instances.read().get(instance_id) {
            return Ok(Arc::clone(instance));
        }

        let mut instances = self.instances.write();
        if let Some(instance) = instances.get(instance_id) {
            return Ok(Arc::clone(instance));
        }
        if instances.len() >= self.max_instances {
            return Err(EngineError::capacity(instances.len() + 1, self.max_instances));
        }

        let instance = Arc::new(MediaInstance::new(
            self.id.clone(),
            instance_id,
            Arc::clone(&self.settings),
            Arc::clone(&self.adapter),
        ));
        instances.insert(instance_id.to_string(), Arc::clone(&instance));
        info!(session = %self.id, instance = instance_id, "Created instance");
        Ok(instance)
    }

    /// Tear down one instance.
    pub fn remove_instance(&self, instance_id: &str) -> EngineResult<()> {
        let removed = self.instances.write().remove(instance_id).ok_or_else(|| {
            EngineError::not_found(format!(
                "instance '{}' in session '{}'",
                instance_id, self.id
            ))
        })?;
        removed.close();

        let mut active = self.active_instance.write();
        if active.as_deref() == Some(instance_id) {
            *active = None;
        }
        info!(session = %self.id, instance = instance_id, "Removed instance");
        Ok(())
    }

    /// Instance ids, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Instance the session's render target shows.
    pub fn active_instance(&self) -> EngineResult<Arc<MediaInstance>> {
        let active = self.active_instance.read().clone();
        match active {
            Some(id) => self.instance(&id),
            None => Err(EngineError::invalid_state(format!(
                "session '{}' has no active instance",
                self.id
            ))),
        }
    }

    pub fn set_active_instance(&self, instance_id: &str) -> EngineResult<()> {
        self.instance(instance_id)?;
        *self.active_instance.write() = Some(instance_id.to_string());
        Ok(())
    }

    /// Tear down every instance.
    pub fn close(&self) {
        for (_, instance) in self.instances.write().drain() {
            instance.close();
        }
        *self.active_instance.write() = None;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("instances", &self.instance_ids())
            .finish_non_exhaustive()
    }
}
