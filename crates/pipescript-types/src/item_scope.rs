//! Scope chain of item lists that templated `{}` references resolve against.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Result, ScriptError};

/// A "scope" of items during a script's execution, with an optional parent scope.
///
/// Cloning an `ItemScope` yields another handle to the **same** scope, so marks
/// recorded while evaluating arguments are visible to whoever later calls
/// [`extract_ignored`](ItemScope::extract_ignored).
#[derive(Clone)]
pub struct ItemScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    parent: Option<ItemScope>,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    items: Vec<String>,
    to_be_ignored: BTreeSet<usize>,
    to_be_removed: BTreeSet<usize>,
}

impl ItemScope {
    /// A scope without a parent.
    pub fn root(items: Vec<String>) -> Self {
        Self::build(None, items)
    }

    /// A new scope nested inside this one.
    pub fn child(&self, items: Vec<String>) -> Self {
        Self::build(Some(self.clone()), items)
    }

    /// A new scope nested inside `parent`, or a root scope if there is none.
    pub fn nested(parent: Option<&ItemScope>, items: Vec<String>) -> Self {
        Self::build(parent.cloned(), items)
    }

    fn build(parent: Option<ItemScope>, items: Vec<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                parent,
                state: Mutex::new(ScopeState {
                    items,
                    ..Default::default()
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn parent(&self) -> Option<&ItemScope> {
        self.inner.parent.as_ref()
    }

    pub fn items(&self) -> Vec<String> {
        self.state().items.clone()
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Replace this scope in place with a sibling under the same parent.
    pub fn set_items(&self, items: Vec<String>) {
        let mut state = self.state();
        state.items = items;
        state.to_be_ignored.clear();
        state.to_be_removed.clear();
    }

    fn ancestor(&self, carrots: usize) -> Result<&ItemScope> {
        let mut scope = self;
        for _ in 0..carrots {
            scope = scope.parent().ok_or_else(|| {
                ScriptError::ItemScope(
                    "Out of scope: References a parent scope beyond scope.".into(),
                )
            })?;
        }
        Ok(scope)
    }

    /// Retrieve a single item from this scope or an ancestor, marking it when
    /// it comes from this scope: `bang` marks it to be ignored (passed around
    /// the pipe), otherwise it is marked for removal.
    pub fn get_item(&self, carrots: usize, index: i64, bang: bool) -> Result<String> {
        let scope = self.ancestor(carrots)?;
        let mut state = scope.state();

        let count = state.items.len() as i64;
        if count == 0 {
            return Err(ScriptError::ItemScope("No items in scope.".into()));
        }
        if index >= count {
            return Err(ScriptError::ItemScope(format!(
                "Out of range: Index {index} out of only {count} items."
            )));
        }
        let resolved = if index < 0 { index + count } else { index };
        if resolved < 0 {
            return Err(ScriptError::ItemScope(format!(
                "Out of range: Negative index {index} out of only {count} items."
            )));
        }
        let resolved = resolved as usize;

        // Only the current scope's marks are ever consumed.
        if carrots == 0 {
            if bang {
                state.to_be_ignored.insert(resolved);
            } else {
                state.to_be_removed.insert(resolved);
            }
        }
        Ok(state.items[resolved].clone())
    }

    /// Retrieve the range `[start, end)` from this scope or an ancestor,
    /// marking it the same way [`get_item`](ItemScope::get_item) does.
    pub fn get_items(
        &self,
        carrots: usize,
        start: Option<i64>,
        end: Option<i64>,
        bang: bool,
    ) -> Result<Vec<String>> {
        let scope = self.ancestor(carrots)?;
        let mut state = scope.state();
        let count = state.items.len() as i64;

        let start = match start {
            None => 0,
            Some(s) => {
                if s > count {
                    return Err(ScriptError::ItemScope(format!(
                        "Out of range: Start index {s} out of only {count} items."
                    )));
                }
                let r = if s < 0 { s + count } else { s };
                if r < 0 {
                    return Err(ScriptError::ItemScope(format!(
                        "Out of range: Negative start index {s} out of only {count} items."
                    )));
                }
                r
            }
        };
        let end = match end {
            None => count,
            Some(e) => {
                if e > count {
                    return Err(ScriptError::ItemScope(format!(
                        "Out of range: End index {e} out of only {count} items."
                    )));
                }
                let r = if e < 0 { e + count } else { e };
                if r < 0 {
                    return Err(ScriptError::ItemScope(format!(
                        "Out of range: Negative end index {e} out of only {count} items."
                    )));
                }
                r
            }
        };
        let (start, end) = (start as usize, (end.max(start)) as usize);

        if carrots == 0 {
            let marks = if bang {
                &mut state.to_be_ignored
            } else {
                &mut state.to_be_removed
            };
            marks.extend(start..end);
        }
        Ok(state.items[start..end].to_vec())
    }

    /// Consume the marks recorded since the last `set_items`.
    ///
    /// Returns `(ignored, remaining)`: the items marked with `!`, in their
    /// original order, and the items left after removing every marked index.
    /// An index marked both ways counts as ignored.
    pub fn extract_ignored(&self) -> (Vec<String>, Vec<String>) {
        let mut state = self.state();
        let ignored_set = std::mem::take(&mut state.to_be_ignored);
        let removed_set = std::mem::take(&mut state.to_be_removed);

        let mut ignored = Vec::new();
        let mut remaining = Vec::with_capacity(state.items.len());
        for (i, item) in state.items.iter().enumerate() {
            if ignored_set.contains(&i) {
                ignored.push(item.clone());
            } else if !removed_set.contains(&i) {
                remaining.push(item.clone());
            }
        }
        (ignored, remaining)
    }
}

impl Default for ItemScope {
    fn default() -> Self {
        Self::root(Vec::new())
    }
}

impl fmt::Debug for ItemScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0;
        let mut scope = self.parent();
        while let Some(s) = scope {
            depth += 1;
            scope = s.parent();
        }
        f.debug_struct("ItemScope")
            .field("items", &self.items())
            .field("depth", &depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[test]
    fn negative_index_marks_for_removal() {
        let scope = ItemScope::root(abc());
        assert_eq!(scope.get_item(0, -1, false).unwrap(), "c");
        let (ignored, items) = scope.extract_ignored();
        assert!(ignored.is_empty());
        assert_eq!(items, vec!["a", "b"]);
    }

    #[test]
    fn bang_wins_over_plain_reference() {
        let scope = ItemScope::root(abc());
        scope.get_item(0, 1, false).unwrap();
        scope.get_item(0, 1, true).unwrap();
        scope.get_item(0, 0, false).unwrap();
        let (ignored, items) = scope.extract_ignored();
        assert_eq!(ignored, vec!["b"]);
        assert_eq!(items, vec!["c"]);
    }

    #[test]
    fn ignored_items_keep_original_order() {
        let scope = ItemScope::root(abc());
        scope.get_item(0, 2, true).unwrap();
        scope.get_item(0, 0, true).unwrap();
        let (ignored, items) = scope.extract_ignored();
        assert_eq!(ignored, vec!["a", "c"]);
        assert_eq!(items, vec!["b"]);
    }

    #[test]
    fn extract_consumes_marks() {
        let scope = ItemScope::root(abc());
        scope.get_item(0, 0, false).unwrap();
        scope.extract_ignored();
        let (_, items) = scope.extract_ignored();
        assert_eq!(items, abc());
    }

    #[test]
    fn parent_references_do_not_mark() {
        let parent = ItemScope::root(abc());
        let child = parent.child(vec!["x".into()]);
        assert_eq!(child.get_item(1, 0, false).unwrap(), "a");
        let (_, parent_items) = parent.extract_ignored();
        assert_eq!(parent_items, abc());
        let (_, child_items) = child.extract_ignored();
        assert_eq!(child_items, vec!["x"]);
    }

    #[test]
    fn too_many_carrots() {
        let scope = ItemScope::root(abc());
        let err = scope.get_item(1, 0, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Out of scope: References a parent scope beyond scope."
        );
    }

    #[test]
    fn out_of_range_errors() {
        let scope = ItemScope::root(abc());
        assert_eq!(
            scope.get_item(0, 3, false).unwrap_err().to_string(),
            "Out of range: Index 3 out of only 3 items."
        );
        assert_eq!(
            scope.get_item(0, -4, false).unwrap_err().to_string(),
            "Out of range: Negative index -4 out of only 3 items."
        );
        let empty = ItemScope::default();
        assert_eq!(
            empty.get_item(0, 0, false).unwrap_err().to_string(),
            "No items in scope."
        );
    }

    #[test]
    fn ranges() {
        let scope = ItemScope::root(abc());
        assert_eq!(scope.get_items(0, Some(1), None, true).unwrap(), vec!["b", "c"]);
        assert_eq!(scope.get_items(0, None, Some(-2), false).unwrap(), vec!["a"]);
        let (ignored, items) = scope.extract_ignored();
        assert_eq!(ignored, vec!["b", "c"]);
        assert!(items.is_empty());
        assert!(scope.get_items(0, Some(4), None, false).is_err());
    }

    #[test]
    fn set_items_resets_marks() {
        let scope = ItemScope::root(abc());
        scope.get_item(0, 0, false).unwrap();
        scope.set_items(vec!["z".into()]);
        let (ignored, items) = scope.extract_ignored();
        assert!(ignored.is_empty());
        assert_eq!(items, vec!["z"]);
    }

    #[test]
    fn clones_share_state() {
        let scope = ItemScope::root(abc());
        let handle = scope.clone();
        handle.get_item(0, 0, false).unwrap();
        let (_, items) = scope.extract_ignored();
        assert_eq!(items, vec!["b", "c"]);
    }
}
