//! Scheme-based opener resolution.
//!
//! The registry maps a URL scheme to a factory that turns a source
//! specification into an ordered list of openers. It is an explicit,
//! immutable mapping built once and passed at construction; there is no
//! process-global registration state.

use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{resolve_file_spec, Opener};
use crate::error::{OpenerError, UnknownSchemeSnafu};

/// Builds openers from a source specification for one scheme.
pub type OpenerFactory =
    Arc<dyn Fn(&str) -> Result<Vec<Box<dyn Opener>>, OpenerError> + Send + Sync>;

/// Immutable scheme → factory mapping.
#[derive(Clone)]
pub struct OpenerRegistry {
    factories: HashMap<String, OpenerFactory>,
}

impl OpenerRegistry {
    /// Start building a registry.
    pub fn builder() -> OpenerRegistryBuilder {
        OpenerRegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in `file` factory registered.
    pub fn with_defaults() -> Self {
        Self::builder()
            .with_scheme("file", |spec| {
                let openers = resolve_file_spec(spec)?;
                Ok(openers
                    .into_iter()
                    .map(|opener| Box::new(opener) as Box<dyn Opener>)
                    .collect())
            })
            .build()
    }

    /// Resolve a source specification into an ordered list of openers.
    ///
    /// `file://` URLs and bare paths resolve through the `file` factory;
    /// any other scheme must have been registered explicitly.
    pub fn resolve(&self, spec: &str) -> Result<Vec<Box<dyn Opener>>, OpenerError> {
        let scheme = detect_scheme(spec);
        let factory = self.factories.get(&scheme).context(UnknownSchemeSnafu {
            scheme: scheme.clone(),
            spec,
        })?;
        debug!("Resolving {:?} via {:?} factory", spec, scheme);
        factory(spec)
    }
}

impl std::fmt::Debug for OpenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("OpenerRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

/// Builder for [`OpenerRegistry`].
pub struct OpenerRegistryBuilder {
    factories: HashMap<String, OpenerFactory>,
}

impl OpenerRegistryBuilder {
    /// Register a factory for a scheme. Later registrations for the same
    /// scheme replace earlier ones.
    pub fn with_scheme<F>(mut self, scheme: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<Box<dyn Opener>>, OpenerError> + Send + Sync + 'static,
    {
        self.factories
            .insert(scheme.into().to_ascii_lowercase(), Arc::new(factory));
        self
    }

    /// Finish building the immutable registry.
    pub fn build(self) -> OpenerRegistry {
        OpenerRegistry {
            factories: self.factories,
        }
    }
}

/// Detect the access scheme of a specification.
///
/// `file://` URLs and specs without a scheme resolve to `file`.
fn detect_scheme(spec: &str) -> String {
    let spec = spec.trim();
    match spec.find("://") {
        Some(idx) => spec[..idx].to_ascii_lowercase(),
        None => "file".to_string(),
    }
}
