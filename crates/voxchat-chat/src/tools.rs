use serde_json::{json, Value};
use voxchat_core::ToolSchema;

/// Functions offered to the model, unique by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolSet {
    tools: Vec<ToolSchema>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any existing tool with the same name.
    pub fn add(&mut self, schema: ToolSchema) {
        match self.tools.iter_mut().find(|t| t.name == schema.name) {
            Some(existing) => *existing = schema,
            None => self.tools.push(schema),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tools.len();
        self.tools.retain(|t| t.name != name);
        self.tools.len() != before
    }

    pub fn clear(&mut self) {
        self.tools.clear();
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSchema> {
        self.tools.iter()
    }

    /// The `tools` array of a chat completion request.
    pub fn to_json(&self) -> Vec<Value> {
        self.tools.iter().map(tool_json).collect()
    }
}

impl From<Vec<ToolSchema>> for ToolSet {
    fn from(schemas: Vec<ToolSchema>) -> Self {
        let mut set = ToolSet::new();
        for schema in schemas {
            set.add(schema);
        }
        set
    }
}

fn tool_json(schema: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": {
                "type": "object",
                "properties": schema.parameters,
                "required": schema.required
            }
        }
    })
}
