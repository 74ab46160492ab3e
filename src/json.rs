// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! JSON representation
//!
//! Subtrees convert to and from [`serde_json::Value`]. Maps become objects
//! (keys in **sorted order**, so output is deterministic), lists become
//! arrays, and primitives map to their JSON counterparts. Node links are
//! followed, so converting the root serializes the whole document.
//!
//! Importing builds the subtree *detached*: no listener fires and no
//! identity changes until the returned node is attached somewhere.
use crate::{
    arena::{Container, NodeId},
    error::TreeError,
    tree::Tree,
    value::Value,
};
use serde_json::{Map, Number, Value as Json};

impl Tree {
    /// Builds a detached subtree from a JSON document.
    ///
    /// The document root must be an object or an array; primitives have no
    /// standalone node representation.
    pub fn node_from_json(&self, json: &Json) -> Result<NodeId, TreeError> {
        match json {
            Json::Object(fields) => {
                let node = self.new_map();
                for (key, value) in fields {
                    let value = self.value_from_json(value)?;
                    self.set(node, key.as_str(), value)?;
                }
                Ok(node)
            }
            Json::Array(items) => {
                let node = self.new_list();
                for item in items {
                    let value = self.value_from_json(item)?;
                    self.push(node, value)?;
                }
                Ok(node)
            }
            _ => Err(TreeError::ScalarDocument),
        }
    }

    /// Builds a subtree from JSON and attaches it as the tree's root.
    pub fn attach_root_json(&self, json: &Json) -> Result<NodeId, TreeError> {
        let node = self.node_from_json(json)?;
        self.attach_root(node)
    }

    fn value_from_json(&self, json: &Json) -> Result<Value, TreeError> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::I64(i)
                } else if let Some(u) = n.as_u64() {
                    Value::U64(u)
                } else {
                    // serde_json numbers are i64, u64, or finite f64
                    Value::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Object(_) | Json::Array(_) => Value::Node(self.node_from_json(json)?),
        })
    }

    /// Serializes the subtree under `node` to JSON.
    pub fn to_json(&self, node: NodeId) -> Result<Json, TreeError> {
        let arena = self.inner.arena.borrow();
        fn node_to_json(
            arena: &crate::arena::Arena,
            node: NodeId,
        ) -> Result<Json, TreeError> {
            Ok(match &arena.get(node)?.container {
                Container::Map(fields) => {
                    let mut keys: Vec<&String> = fields.keys().collect();
                    keys.sort();
                    let mut obj = Map::with_capacity(keys.len());
                    for key in keys {
                        obj.insert(key.clone(), value_to_json(arena, &fields[key])?);
                    }
                    Json::Object(obj)
                }
                Container::List(items) => {
                    let mut arr = Vec::with_capacity(items.len());
                    for item in items {
                        arr.push(value_to_json(arena, item)?);
                    }
                    Json::Array(arr)
                }
            })
        }
        fn value_to_json(
            arena: &crate::arena::Arena,
            value: &Value,
        ) -> Result<Json, TreeError> {
            Ok(match value {
                Value::Null => Json::Null,
                Value::Bool(b) => Json::Bool(*b),
                Value::I64(i) => Json::Number((*i).into()),
                Value::U64(u) => Json::Number((*u).into()),
                Value::F64(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
                Value::String(s) => Json::String(s.clone()),
                Value::Node(child) => node_to_json(arena, *child)?,
            })
        }
        node_to_json(&arena, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_nested_document() {
        let tree = Tree::new();
        let doc = json!({
            "name": "obtree",
            "ready": true,
            "weight": 1.5,
            "tags": ["state", "tree"],
            "nested": { "depth": 2 }
        });
        let root = tree.attach_root_json(&doc).unwrap();
        assert_eq!(tree.to_json(root).unwrap(), doc);
    }

    #[test]
    fn import_is_silent_until_attached() {
        let tree = Tree::new();
        let root = tree.new_map();
        tree.attach_root(root).unwrap();

        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let sink = fired.clone();
        tree.on_subtree_changed(root, move |_| {
            sink.set(sink.get() + 1);
        })
        .unwrap();

        let imported = tree.node_from_json(&json!({ "a": [1, 2] })).unwrap();
        assert_eq!(fired.get(), 0);

        tree.set(root, "imported", Value::Node(imported)).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn scalar_root_is_rejected() {
        let tree = Tree::new();
        assert_eq!(
            tree.node_from_json(&json!(42)).unwrap_err(),
            TreeError::ScalarDocument
        );
        assert_eq!(
            tree.node_from_json(&json!("root")).unwrap_err(),
            TreeError::ScalarDocument
        );
    }

    #[test]
    fn object_keys_serialize_in_sorted_order() {
        let tree = Tree::new();
        let root = tree
            .node_from_json(&json!({ "zeta": 1, "alpha": 2, "mid": 3 }))
            .unwrap();
        let out = tree.to_json(root).unwrap();
        let keys: Vec<&str> = out.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["alpha", "mid", "zeta"]);
    }
}
