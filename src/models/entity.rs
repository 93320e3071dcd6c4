use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of entity a sync event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Bookmark,
    Collection,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Bookmark => "bookmark",
            EntityType::Collection => "collection",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bookmark" => Ok(EntityType::Bookmark),
            "collection" => Ok(EntityType::Collection),
            _ => Err(format!(
                "Invalid entity type '{}'. Valid options: bookmark, collection",
                s
            )),
        }
    }
}

/// Mutation carried by a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(format!(
                "Invalid operation '{}'. Valid options: create, update, delete",
                s
            )),
        }
    }
}

/// Applies one operation to an entity snapshot and returns the new snapshot.
///
/// `create` replaces the snapshot with the payload, `update` applies the
/// payload as a JSON merge patch (RFC 7396) and `delete` clears it. An update
/// against a missing snapshot starts from an empty object.
pub fn apply_operation(snapshot: Option<Value>, operation: Operation, payload: &Value) -> Option<Value> {
    match operation {
        Operation::Create => Some(payload.clone()),
        Operation::Update => {
            let mut target = snapshot.unwrap_or_else(|| Value::Object(Map::new()));
            merge_patch(&mut target, payload);
            Some(target)
        }
        Operation::Delete => None,
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
