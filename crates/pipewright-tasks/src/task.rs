//! Task descriptors

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identity of one schedulable unit of work.
///
/// Equality and ordering cover all three fields. Ordering only gives tasks a
/// stable position in ordered containers; it never implies priority.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Task kind (e.g. "compile", "manifest")
    pub name: String,
    /// Source file the task operates on, empty when not file-specific
    pub source_file: String,
    /// Pipeline-owned payload, opaque to the scheduler
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl TaskDescriptor {
    /// Create a descriptor with a raw payload
    pub fn new(name: impl Into<String>, source_file: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source_file: source_file.into(),
            payload,
        }
    }

    /// Create a descriptor whose payload is the JSON encoding of `payload`
    pub fn encode<T: Serialize>(
        name: impl Into<String>,
        source_file: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(name, source_file, serde_json::to_vec(payload)?))
    }

    /// Decode the payload back into the pipeline's task type
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Whether this descriptor names the given task, optionally for one source
    pub fn matches(&self, name: &str, source_file: Option<&str>) -> bool {
        self.name == name && source_file.map_or(true, |s| self.source_file == s)
    }
}

impl fmt::Display for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source_file.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}({})", self.name, self.source_file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Payload {
        Source { path: String },
        Manifest,
    }

    #[test]
    fn test_display() {
        assert_eq!(TaskDescriptor::new("compile", "a.src", vec![]).to_string(), "compile(a.src)");
        assert_eq!(TaskDescriptor::new("complete", "", vec![]).to_string(), "complete");
    }

    #[test]
    fn test_equality_includes_payload() {
        let a = TaskDescriptor::new("compile", "a.src", vec![1]);
        let b = TaskDescriptor::new("compile", "a.src", vec![2]);
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_encode_decode_payload() {
        let task = TaskDescriptor::encode(
            "compile",
            "a.src",
            &Payload::Source {
                path: "a.src".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            task.decode::<Payload>().unwrap(),
            Payload::Source {
                path: "a.src".to_string()
            }
        );

        let manifest = TaskDescriptor::encode("manifest", "", &Payload::Manifest).unwrap();
        assert!(manifest.decode::<u32>().is_err());
    }

    #[test]
    fn test_matches() {
        let task = TaskDescriptor::new("compile", "a.src", vec![]);
        assert!(task.matches("compile", None));
        assert!(task.matches("compile", Some("a.src")));
        assert!(!task.matches("compile", Some("b.src")));
        assert!(!task.matches("link", None));
    }
}
