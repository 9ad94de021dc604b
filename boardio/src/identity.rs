//! Identity shared by providers, platforms and I/O handles.
//!
//! The id is fixed at construction; name and description are display labels
//! that may change over the entity's lifetime.

use std::sync::{PoisonError, RwLock};

use crate::error::{Collection, Error, Result};

/// Id, name and description of a managed entity.
#[derive(Debug)]
pub struct Identity {
    id: String,
    name: RwLock<String>,
    description: RwLock<String>,
}

impl Identity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: RwLock::new(name.into()),
            description: RwLock::new(description.into()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn description(&self) -> String {
        self.description
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self
            .description
            .write()
            .unwrap_or_else(PoisonError::into_inner) = description.into();
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self::new(self.id.clone(), self.name(), self.description())
    }
}

/// Validate an id used as a key in a managed store.
///
/// Returns the trimmed id. Blank ids are an [`Error::InvalidId`], never a
/// not-found condition.
pub fn validate_id(kind: Collection, id: &str) -> Result<&str> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId {
            kind,
            id: id.to_string(),
        });
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_and_description_are_mutable() {
        let identity = Identity::new("led", "Status LED", "");
        identity.set_name("Power LED");
        identity.set_description("GPIO 17");

        assert_eq!(identity.id(), "led");
        assert_eq!(identity.name(), "Power LED");
        assert_eq!(identity.description(), "GPIO 17");
    }

    #[test]
    fn test_validate_id() {
        assert_eq!(validate_id(Collection::Registry, "  led ").unwrap(), "led");

        let err = validate_id(Collection::Providers, "   ").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidId {
                kind: Collection::Providers,
                ..
            }
        ));
        assert!(validate_id(Collection::Platforms, "").is_err());
    }
}
