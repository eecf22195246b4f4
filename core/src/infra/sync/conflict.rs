//! Conflict markers in JSON document trees
//!
//! A document is a tree of nodes, each an object that may carry an `id` and a
//! `children` array. When a write to a node loses an optimistic-lock race the
//! losing change is not thrown away silently: a marker is appended to the
//! node's `conflicts` array so every reader sees that a write was dropped.

use serde_json::{json, Value};

/// Key holding a node's markers
pub const CONFLICTS_KEY: &str = "conflicts";

/// Append a conflict marker to the node whose `id` is `target_id`
///
/// `target_id = None` marks the root. Returns whether a node was found.
pub fn inject_marker(tree: &mut Value, target_id: Option<&str>, message: &str) -> bool {
	let node = match target_id {
		Some(id) => find_node(tree, id),
		None => Some(tree),
	};

	let Some(Value::Object(node)) = node else {
		return false;
	};

	let marker = json!({ "message": message });
	match node.get_mut(CONFLICTS_KEY) {
		Some(Value::Array(markers)) => markers.push(marker),
		_ => {
			node.insert(CONFLICTS_KEY.to_string(), Value::Array(vec![marker]));
		}
	}

	true
}

/// Depth-first search for the node with `id`
fn find_node<'a>(tree: &'a mut Value, id: &str) -> Option<&'a mut Value> {
	if tree.get("id").and_then(Value::as_str) == Some(id) {
		return Some(tree);
	}

	match tree {
		Value::Object(map) => map.values_mut().find_map(|child| find_node(child, id)),
		Value::Array(items) => items.iter_mut().find_map(|item| find_node(item, id)),
		_ => None,
	}
}
