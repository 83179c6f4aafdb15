//! Capture analysis.
//!
//! For every closure and every free variable it references, walk from the
//! closure's scope up to the variable's declaring scope. Each scope on the way
//! forwards the capture, and each closure scope on the way needs it, since the
//! inner closure is created while the intermediate closure's body runs.

use crate::error::LowerError;
use crate::scope::{ClosureId, ScopeId, ScopeTree, VarId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// One (variable, closure) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capture {
    pub var: VarId,
    pub declared_in: ScopeId,
    pub closure: ClosureId,
    /// The closure names the variable itself rather than forwarding it to a
    /// nested closure.
    pub direct: bool,
    pub escapes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedVar {
    pub escapes: bool,
    /// Closures that need the variable, directly or by forwarding.
    pub users: BTreeSet<ClosureId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forwarding {
    pub vars: BTreeSet<VarId>,
    pub escaping: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureAnalysis {
    /// Sorted by (closure, var).
    pub captures: Vec<Capture>,
    pub captured: BTreeMap<VarId, CapturedVar>,
    /// Scopes that forward at least one capture.
    pub forwarding: BTreeMap<ScopeId, Forwarding>,
    /// Variables each closure needs; every closure of the unit has an entry.
    pub needs: BTreeMap<ClosureId, BTreeSet<VarId>>,
}

impl CaptureAnalysis {
    pub fn analyze(tree: &ScopeTree) -> Result<Self, LowerError> {
        let mut out = CaptureAnalysis::default();
        for c in &tree.closures {
            out.needs.entry(c.id).or_default();
        }

        for c in &tree.closures {
            for &v in &c.free_vars {
                let decl = tree.var(v)?.scope;
                if !tree.is_strict_ancestor(decl, c.scope) {
                    return Err(LowerError::structural(format!(
                        "capture '{}' of closure {} does not resolve to an enclosing scope",
                        tree.var(v)?.name,
                        c.id
                    )));
                }
                let mut cur = c.scope;
                while cur != decl {
                    let scope = tree.scope(cur)?;
                    out.forwarding.entry(cur).or_default().vars.insert(v);
                    if let Some(user) = scope.closure {
                        out.needs.entry(user).or_default().insert(v);
                        out.captured.entry(v).or_default().users.insert(user);
                    }
                    cur = scope.parent.ok_or_else(|| {
                        LowerError::structural(format!(
                            "scope chain of closure {} ends before {}",
                            c.id, decl
                        ))
                    })?;
                }
            }
        }

        // escape is a monotonic OR over everything an escaping closure needs
        for c in tree.closures.iter().filter(|c| c.escapes) {
            let needed: Vec<VarId> = out
                .needs
                .get(&c.id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for v in needed {
                if let Some(cv) = out.captured.get_mut(&v) {
                    cv.escapes = true;
                }
                let decl = tree.var(v)?.scope;
                let mut cur = c.scope;
                while cur != decl {
                    if let Some(fw) = out.forwarding.get_mut(&cur) {
                        fw.escaping = true;
                    }
                    match tree.scope(cur)?.parent {
                        Some(p) => cur = p,
                        None => break,
                    }
                }
            }
        }

        for c in &tree.closures {
            let Some(needed) = out.needs.get(&c.id) else {
                continue;
            };
            for &v in needed {
                let var = tree.var(v)?;
                let escapes = out.captured.get(&v).map(|cv| cv.escapes).unwrap_or(false);
                trace!(closure = %c.id, var = %var.name, escapes, "capture");
                out.captures.push(Capture {
                    var: v,
                    declared_in: var.scope,
                    closure: c.id,
                    direct: c.free_vars.contains(&v),
                    escapes,
                });
            }
        }
        Ok(out)
    }

    pub fn is_captured(&self, v: VarId) -> bool {
        self.captured.contains_key(&v)
    }

    pub fn escapes(&self, v: VarId) -> bool {
        self.captured.get(&v).map(|cv| cv.escapes).unwrap_or(false)
    }

    pub fn users(&self, v: VarId) -> BTreeSet<ClosureId> {
        self.captured
            .get(&v)
            .map(|cv| cv.users.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::bind_module;
    use capsule_parse::parse_str;

    fn analyze(src: &str) -> (ScopeTree, CaptureAnalysis) {
        let m = parse_str("<test>", src).expect("parse failed");
        let tree = bind_module(&m, "test").expect("bind failed");
        let a = CaptureAnalysis::analyze(&tree).expect("analysis failed");
        (tree, a)
    }

    fn var(tree: &ScopeTree, name: &str) -> VarId {
        tree.find_var(name).expect("no such var").id
    }

    #[test]
    fn intermediate_closure_forwards_capture() {
        let (tree, a) = analyze("fn main() { let x = 1; let f = || { let g = || x; g() }; f() }");
        let x = var(&tree, "x");
        assert!(a.needs[&ClosureId(0)].contains(&x));
        assert!(a.needs[&ClosureId(1)].contains(&x));
        let forwarded: Vec<_> = a.captures.iter().filter(|c| !c.direct).collect();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].closure, ClosureId(0));
    }

    #[test]
    fn non_escaping_captures_are_not_marked() {
        let (tree, a) = analyze("fn main() { let x = 1; let f = || x; f() }");
        assert!(a.is_captured(var(&tree, "x")));
        assert!(!a.escapes(var(&tree, "x")));
    }

    #[test]
    fn escape_marks_forwarding_chain() {
        let (tree, a) = analyze("fn make() { let x = 1; let f = || { || x }; f }");
        let x = var(&tree, "x");
        assert!(a.escapes(x));
        let outer_scope = tree.closures[0].scope;
        assert!(a.forwarding[&outer_scope].escaping);
    }

    #[test]
    fn uncaptured_locals_have_no_entry() {
        let (tree, a) = analyze("fn main() { let x = 1; let y = 2; let f = || x; f() + y }");
        assert!(!a.is_captured(var(&tree, "y")));
    }

    #[test]
    fn misplaced_free_var_is_structural() {
        let m = parse_str("<test>", "fn main() { let f = |p| p; let x = 1; f(x) }").expect("parse");
        let mut tree = bind_module(&m, "test").expect("bind");
        // `p` lives inside the closure itself
        let p = tree.find_var("p").expect("p").id;
        tree.closures[0].free_vars.push(p);
        let err = CaptureAnalysis::analyze(&tree).unwrap_err();
        assert!(matches!(err, LowerError::Structural { .. }));
    }
}
