//! Structural diff and patch over JSON value graphs.
//!
//! `diff(before, after)` walks both trees in lock-step and emits the
//! path-addressed edits that turn `before` into `after`:
//!
//! ```text
//! object vs object  → delete (key only in before), recurse (shared key),
//!                     add (key only in after); keys in sorted order
//! array  vs array   → recurse on shared indices, add trailing indices,
//!                     delete surplus indices from the highest down
//! anything else     → update with the whole new sub-value (if not equal)
//! ```
//!
//! `apply(base, patch)` never touches `base`; it patches a clone and either
//! returns the whole result or the first [`PatchError`]. `add`/`update`
//! upsert and `delete` of an absent target is a no-op, so re-applying the
//! same patch is idempotent (broadcast echoes rely on this). A patch whose
//! parent path no longer resolves is a [`PatchError::Conflict`].
//!
//! `revert(current, before, after)` undoes a `before → after` edit on a value
//! that may have moved on since: a path is only reverted while it still
//! holds what `after` put there.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of a patch path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => write!(f, "{k}"),
        }
    }
}

pub type Path = Vec<PathSegment>;

/// Render a path as a slash-separated pointer (`/emails/0/address`).
pub fn format_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|segment| format!("/{segment}")).collect()
}

/// A single path-addressed edit.
///
/// Wire shape: `{"op": "add"|"update"|"delete", "path": [...], "value"?, "old_value"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add {
        path: Path,
        value: Value,
    },
    Update {
        path: Path,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_value: Option<Value>,
    },
    Delete {
        path: Path,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_value: Option<Value>,
    },
}

impl PatchOp {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Add { path, .. } | Self::Update { path, .. } | Self::Delete { path, .. } => path,
        }
    }

    /// New value carried by `add`/`update`; `None` for `delete`.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Add { value, .. } | Self::Update { value, .. } => Some(value),
            Self::Delete { .. } => None,
        }
    }

    pub fn old_value(&self) -> Option<&Value> {
        match self {
            Self::Update { old_value, .. } | Self::Delete { old_value, .. } => old_value.as_ref(),
            Self::Add { .. } => None,
        }
    }
}

/// Patch application errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// The patch addresses state that no longer exists in the base.
    #[error("Patch conflict at {path}: {reason}")]
    Conflict { path: String, reason: &'static str },
    /// The document root cannot be deleted.
    #[error("Cannot delete the document root")]
    RootDelete,
}

/// Compute the edit list that transforms `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_into(before, after, &mut path, &mut ops);
    ops
}

fn diff_into(before: &Value, after: &Value, path: &mut Path, ops: &mut Vec<PatchOp>) {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_child) in old {
                path.push(PathSegment::Key(key.clone()));
                match new.get(key) {
                    Some(new_child) => diff_into(old_child, new_child, path, ops),
                    None => ops.push(PatchOp::Delete {
                        path: path.clone(),
                        old_value: Some(old_child.clone()),
                    }),
                }
                path.pop();
            }
            for (key, new_child) in new {
                if !old.contains_key(key) {
                    path.push(PathSegment::Key(key.clone()));
                    ops.push(PatchOp::Add {
                        path: path.clone(),
                        value: new_child.clone(),
                    });
                    path.pop();
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let shared = old.len().min(new.len());
            for (i, (old_item, new_item)) in old.iter().zip(new.iter()).enumerate() {
                path.push(PathSegment::Index(i));
                diff_into(old_item, new_item, path, ops);
                path.pop();
            }
            for (i, new_item) in new.iter().enumerate().skip(shared) {
                path.push(PathSegment::Index(i));
                ops.push(PatchOp::Add {
                    path: path.clone(),
                    value: new_item.clone(),
                });
                path.pop();
            }
            // Highest index first so every delete still addresses its element.
            for i in (shared..old.len()).rev() {
                path.push(PathSegment::Index(i));
                ops.push(PatchOp::Delete {
                    path: path.clone(),
                    old_value: Some(old[i].clone()),
                });
                path.pop();
            }
        }
        _ if before == after => {}
        _ => ops.push(PatchOp::Update {
            path: path.clone(),
            value: after.clone(),
            old_value: Some(before.clone()),
        }),
    }
}

/// Apply `patch` to a copy of `base`.
///
/// All-or-nothing: on error nothing is returned and `base` is untouched.
pub fn apply(base: &Value, patch: &[PatchOp]) -> Result<Value, PatchError> {
    let mut next = base.clone();
    for op in patch {
        apply_op(&mut next, op)?;
    }
    Ok(next)
}

/// Apply one op in place.
///
/// Callers that need atomicity across several ops should use [`apply`].
pub fn apply_op(target: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let Some((last, parent_path)) = op.path().split_last() else {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Update { value, .. } => {
                *target = value.clone();
                Ok(())
            }
            PatchOp::Delete { .. } => Err(PatchError::RootDelete),
        };
    };

    let conflict = |reason| PatchError::Conflict {
        path: format_path(op.path()),
        reason,
    };

    let parent = resolve_mut(target, parent_path).ok_or_else(|| conflict("parent path missing"))?;

    match op {
        PatchOp::Add { value, .. } | PatchOp::Update { value, .. } => match (parent, last) {
            (Value::Object(map), segment) => {
                map.insert(segment.to_string(), value.clone());
                Ok(())
            }
            (Value::Array(items), PathSegment::Index(i)) => {
                if *i < items.len() {
                    items[*i] = value.clone();
                    Ok(())
                } else if *i == items.len() {
                    items.push(value.clone());
                    Ok(())
                } else {
                    Err(conflict("index beyond end of sequence"))
                }
            }
            _ => Err(conflict("parent is not a container for this segment")),
        },
        PatchOp::Delete { .. } => match (parent, last) {
            (Value::Object(map), segment) => {
                map.remove(&segment.to_string());
                Ok(())
            }
            (Value::Array(items), PathSegment::Index(i)) => {
                if *i < items.len() {
                    items.remove(*i);
                }
                Ok(())
            }
            _ => Err(conflict("parent is not a container for this segment")),
        },
    }
}

/// Undo the `before → after` edit on `current`, path by path.
///
/// Paths whose value in `current` differs from `after` were changed by
/// someone else and are left alone, as are inverse ops that no longer fit.
pub fn revert(current: &Value, before: &Value, after: &Value) -> Value {
    let mut next = current.clone();
    for op in diff(after, before) {
        if get(&next, op.path()) != get(after, op.path()) {
            continue;
        }
        let mut attempt = next.clone();
        if apply_op(&mut attempt, &op).is_ok() {
            next = attempt;
        }
    }
    next
}

/// Read the sub-value at `path`.
pub fn get<'a>(mut current: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    for segment in path {
        current = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get(key)?,
            (Value::Object(map), PathSegment::Index(i)) => map.get(&i.to_string())?,
            (Value::Array(items), PathSegment::Index(i)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve_mut<'a>(mut current: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut Value> {
    for segment in path {
        current = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key)?,
            (Value::Object(map), PathSegment::Index(i)) => map.get_mut(&i.to_string())?,
            (Value::Array(items), PathSegment::Index(i)) => items.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(current)
}
