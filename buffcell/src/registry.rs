//! Registry mapping buffer names to their cells
//!
//! Registration happens once, before the cells are shared with other
//! threads, which is why it takes `&mut self`. Lookups are typed: the
//! caller names the element type and gets `TypeMismatch` if the cell
//! was registered with another one.

use std::any::{type_name, Any};
use std::collections::HashMap;

use tracing::debug;

use crate::cell::{BufferCell, ReloadFn};
use crate::config::RegistryConfig;
use crate::error::{BuffError, ReloadError, Result};

struct RegistryEntry {
    cell: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Explicit registry of named buffer cells
///
/// # Example
///
/// ```
/// use buffcell::BufferRegistry;
///
/// let mut registry = BufferRegistry::new();
/// registry.register("cfg", 0, |x: &i32| x + 1).unwrap();
///
/// let cfg = registry.get::<i32>("cfg").unwrap();
/// assert_eq!(cfg.load().unwrap(), 1);
/// ```
pub struct BufferRegistry {
    config: RegistryConfig,
    buffers: HashMap<String, RegistryEntry>,
}

impl BufferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            buffers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a buffer with an infallible reload function
    ///
    /// # Arguments
    /// * `name` - Unique buffer name
    /// * `initial` - Value passed to the first reload
    /// * `reload` - Computes the new value from the current one
    ///
    /// # Errors
    ///
    /// Returns `BuffError::AlreadyRegistered` if `name` is taken.
    pub fn register<T, F>(
        &mut self,
        name: impl Into<String>,
        initial: T,
        reload: F,
    ) -> Result<BufferCell<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        self.insert(
            name.into(),
            initial,
            Box::new(move |value: &T| Ok(reload(value))),
        )
    }

    /// Register a buffer whose reload function may fail
    ///
    /// A failed reload is reported to the `load` caller as
    /// `BuffError::ReloadFailed` and retried by the next `load`.
    ///
    /// # Errors
    ///
    /// Returns `BuffError::AlreadyRegistered` if `name` is taken.
    pub fn register_fallible<T, F, E>(
        &mut self,
        name: impl Into<String>,
        initial: T,
        reload: F,
    ) -> Result<BufferCell<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> std::result::Result<T, E> + Send + Sync + 'static,
        E: Into<ReloadError>,
    {
        self.insert(
            name.into(),
            initial,
            Box::new(move |value: &T| reload(value).map_err(Into::into)),
        )
    }

    /// Get the cell registered under `name`
    ///
    /// # Errors
    ///
    /// - `BuffError::NotRegistered` if `name` was never registered
    /// - `BuffError::TypeMismatch` if the cell holds another type than `T`
    pub fn get<T>(&self, name: &str) -> Result<BufferCell<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self
            .buffers
            .get(name)
            .ok_or_else(|| BuffError::NotRegistered(name.to_string()))?;

        entry
            .cell
            .downcast_ref::<BufferCell<T>>()
            .cloned()
            .ok_or_else(|| BuffError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
                actual: entry.type_name,
            })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn insert<T>(
        &mut self,
        name: String,
        initial: T,
        reload: Box<ReloadFn<T>>,
    ) -> Result<BufferCell<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.buffers.contains_key(&name) {
            return Err(BuffError::AlreadyRegistered(name));
        }

        let cell = BufferCell::from_parts(
            name.clone(),
            initial,
            reload,
            self.config.channel_capacity,
        );
        debug!(buffer = %name, value_type = type_name::<T>(), "register buffer");

        self.buffers.insert(
            name,
            RegistryEntry {
                cell: Box::new(cell.clone()),
                type_name: type_name::<T>(),
            },
        );
        Ok(cell)
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("config", &self.config)
            .field("names", &self.names())
            .finish()
    }
}
