//! Component lifecycle
//!
//! Services are started in registration order and stopped in reverse. A
//! component that fails to start causes the already-started ones to be
//! stopped again.

use crate::error::Result;
use std::sync::Arc;
use tracing::{error, info};

/// A startable / stoppable service component
pub trait Lifecycle: Send + Sync {
    /// Component name for logging
    fn name(&self) -> &str;

    /// Start background work
    fn start(&self) -> Result<()>;

    /// Stop background work; must be idempotent
    fn stop(&self);
}

/// Ordered set of components
#[derive(Default)]
pub struct LifecycleSet {
    components: Vec<Arc<dyn Lifecycle>>,
    started: usize,
}

impl LifecycleSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a component; it starts after those added before it
    pub fn add(&mut self, component: Arc<dyn Lifecycle>) {
        self.components.push(component);
    }

    /// Number of components
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Start every component in order
    pub fn start_all(&mut self) -> Result<()> {
        while self.started < self.components.len() {
            let component = &self.components[self.started];
            if let Err(e) = component.start() {
                error!("Failed to start {}: {}", component.name(), e);
                self.stop_all();
                return Err(e);
            }
            info!("Started {}", component.name());
            self.started += 1;
        }
        Ok(())
    }

    /// Stop started components in reverse order
    pub fn stop_all(&mut self) {
        while self.started > 0 {
            self.started -= 1;
            let component = &self.components[self.started];
            component.stop();
            info!("Stopped {}", component.name());
        }
    }
}

impl Drop for LifecycleSet {
    fn drop(&mut self) {
        self.stop_all();
    }
}
