//! Versioned payload schemas. Each schema wraps a typed struct; validation
//! deserializes the payload into it at the boundary.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Payload contract for one event type, tagged with a `major.minor` version.
#[derive(Clone)]
pub struct EventSchema {
    pub version: String,
    pub description: String,
    validator: Validator,
}

impl EventSchema {
    /// Builds a schema that validates payloads by deserializing into `T`.
    pub fn of<T: DeserializeOwned>(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: String::new(),
            validator: Arc::new(|value: &Value| {
                serde_json::from_value::<T>(value.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self, value: &Value) -> Result<(), String> {
        (self.validator)(value)
    }

    /// True when `other`'s major version component equals this schema's.
    pub fn major_matches(&self, other: &str) -> bool {
        major_of(&self.version) == major_of(other)
    }
}

fn major_of(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

impl std::fmt::Debug for EventSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSchema")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Payload {
        #[allow(dead_code)]
        name: String,
    }

    #[test]
    fn validates_shape() {
        let schema = EventSchema::of::<Payload>("1.0");
        assert!(schema.validate(&serde_json::json!({"name": "x"})).is_ok());
        assert!(schema.validate(&serde_json::json!({"name": 1})).is_err());
        assert!(schema.validate(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn major_comparison() {
        let schema = EventSchema::of::<Payload>("2.3");
        assert!(schema.major_matches("2.0"));
        assert!(schema.major_matches("2.11"));
        assert!(!schema.major_matches("1.9"));
    }
}
