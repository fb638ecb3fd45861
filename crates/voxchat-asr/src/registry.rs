use crate::recognizer_trait::Recognizer;
use std::collections::HashMap;
use voxchat_core::AsrError;

pub struct RecognizerRegistry {
    factories: HashMap<String, fn() -> Box<dyn Recognizer>>,
}

impl RecognizerRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("null", || Box::new(crate::null_recognizer::NullRecognizer::new()));
        registry.register("dashscope", || {
            Box::new(crate::dashscope::DashScopeRecognizer::new())
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: fn() -> Box<dyn Recognizer>) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Recognizer>, AsrError> {
        self.factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| AsrError::EngineNotFound(name.to_string()))
    }

    pub fn list_engines(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for RecognizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_builtin_engines() {
        let registry = RecognizerRegistry::new();
        assert_eq!(registry.list_engines(), vec!["dashscope", "null"]);
    }

    #[test]
    fn test_registry_create_returns_named_engine() {
        let registry = RecognizerRegistry::new();
        assert_eq!(registry.create("dashscope").unwrap().name(), "dashscope");
        assert_eq!(registry.create("null").unwrap().name(), "null");
    }

    #[test]
    fn test_registry_create_unknown_returns_error() {
        let registry = RecognizerRegistry::new();
        match registry.create("nope") {
            Err(AsrError::EngineNotFound(name)) => assert_eq!(name, "nope"),
            _ => panic!("expected EngineNotFound error"),
        }
    }

    #[test]
    fn test_registry_register_custom_engine() {
        let mut registry = RecognizerRegistry::new();
        registry.register("offline", || Box::new(crate::NullRecognizer::new()));
        // Factory output keeps its own name
        assert_eq!(registry.create("offline").unwrap().name(), "null");
    }

    #[test]
    fn test_credential_requirement_per_engine() {
        let registry = RecognizerRegistry::new();
        assert!(registry.create("dashscope").unwrap().requires_credential());
        assert!(!registry.create("null").unwrap().requires_credential());
    }
}
