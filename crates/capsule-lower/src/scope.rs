//! The validated lexical-scope tree consumed by lowering.
//!
//! Scopes are stored in preorder: a scope's id is also its ordinal within the
//! unit, and every parent precedes its children. That ordering is what makes
//! parent chains acyclic, so [`ScopeTree::validate`] checks it explicitly.

use crate::error::LowerError;
use crate::hir::{HirBlock, HirExpr};
use crate::types::Ty;
use capsule_ast::span::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(ScopeId, "s");
id_type!(VarId, "v");
id_type!(ClosureId, "c");
id_type!(FnId, "f");

/// Name of the synthetic function that owns global initializers.
pub const MODULE_FN: &str = "<module>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Function,
    Closure,
    Block,
    Loop,
}

/// Stable, edit-tolerant identity of a scope: the owning function's name
/// followed by child positions, e.g. `main/0/1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(pub String);

impl ScopeKey {
    pub fn root(function: &str) -> Self {
        ScopeKey(function.to_string())
    }

    pub fn child(&self, index: usize) -> Self {
        ScopeKey(format!("{}/{}", self.0, index))
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub key: ScopeKey,
    /// Function whose body contains this scope.
    pub owner: FnId,
    /// Set on `Closure` scopes.
    pub closure: Option<ClosureId>,
    pub depth: u32,
    pub span: Span,
}

impl Scope {
    pub fn ordinal(&self) -> u32 {
        self.id.0
    }

    /// Function and closure scopes start a new body; everything else is
    /// lowered into the body that contains it.
    pub fn is_body(&self) -> bool {
        matches!(self.kind, ScopeKind::Function | ScopeKind::Closure)
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub ty: Ty,
    pub mutable: bool,
    pub scope: ScopeId,
    pub is_param: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ClosureInfo {
    pub id: ClosureId,
    /// Scope holding the closure's parameters and body locals.
    pub scope: ScopeId,
    /// Scope in which the closure literal is evaluated.
    pub declared_in: ScopeId,
    pub owner: FnId,
    /// Position among the closures of the owning function, in source order.
    pub ordinal: u32,
    /// Variables declared outside `scope` that the body refers to directly,
    /// in first-reference order.
    pub free_vars: Vec<VarId>,
    /// Conservative hint: the closure value may outlive its declaring scope.
    pub escapes: bool,
    pub params: Vec<VarId>,
    pub body: HirExpr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FnInfo {
    pub id: FnId,
    pub name: String,
    pub generics: Vec<String>,
    pub scope: ScopeId,
    pub ordinal: u32,
    pub params: Vec<VarId>,
    pub ret: Ty,
    pub body: HirBlock,
    /// True for the synthetic function owning global initializers.
    pub synthetic: bool,
}

impl FnInfo {
    pub fn is_generic(&self) -> bool {
        !self.generics.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub name: String,
    pub mutable: bool,
    pub ty: Ty,
    pub init: HirExpr,
}

#[derive(Debug, Clone)]
pub struct ScopeTree {
    pub unit: String,
    pub scopes: Vec<Scope>,
    pub vars: Vec<Variable>,
    pub closures: Vec<ClosureInfo>,
    pub fns: Vec<FnInfo>,
    pub globals: Vec<GlobalInfo>,
}

impl ScopeTree {
    pub fn scope(&self, id: ScopeId) -> Result<&Scope, LowerError> {
        self.scopes
            .get(id.index())
            .ok_or_else(|| LowerError::structural(format!("unknown scope {}", id)))
    }

    pub fn var(&self, id: VarId) -> Result<&Variable, LowerError> {
        self.vars
            .get(id.index())
            .ok_or_else(|| LowerError::structural(format!("unknown variable {}", id)))
    }

    pub fn closure(&self, id: ClosureId) -> Result<&ClosureInfo, LowerError> {
        self.closures
            .get(id.index())
            .ok_or_else(|| LowerError::structural(format!("unknown closure {}", id)))
    }

    pub fn function(&self, id: FnId) -> Result<&FnInfo, LowerError> {
        self.fns
            .get(id.index())
            .ok_or_else(|| LowerError::structural(format!("unknown function {}", id)))
    }

    pub fn find_var(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn find_scope(&self, key: &str) -> Option<&Scope> {
        self.scopes.iter().find(|s| s.key.0 == key)
    }

    /// `anc` encloses `s` and differs from it.
    pub fn is_strict_ancestor(&self, anc: ScopeId, s: ScopeId) -> bool {
        let mut cur = self.scopes.get(s.index()).and_then(|sc| sc.parent);
        while let Some(id) = cur {
            if id == anc {
                return true;
            }
            cur = self.scopes.get(id.index()).and_then(|sc| sc.parent);
        }
        false
    }

    /// Nearest function or closure scope at or above `s`.
    pub fn body_of(&self, s: ScopeId) -> Result<ScopeId, LowerError> {
        let mut cur = s;
        loop {
            let scope = self.scope(cur)?;
            if scope.is_body() {
                return Ok(cur);
            }
            cur = scope.parent.ok_or_else(|| {
                LowerError::structural(format!("scope {} has no enclosing body", s))
            })?;
        }
    }

    /// Closures whose scope lies on the path from `inner` (inclusive) up to
    /// `outer` (exclusive). `outer` must enclose `inner`.
    pub fn closures_between(
        &self,
        inner: ScopeId,
        outer: ScopeId,
    ) -> Result<Vec<ClosureId>, LowerError> {
        let mut out = Vec::new();
        let mut cur = inner;
        while cur != outer {
            let scope = self.scope(cur)?;
            if let Some(c) = scope.closure {
                out.push(c);
            }
            cur = scope.parent.ok_or_else(|| {
                LowerError::structural(format!("scope {} does not enclose {}", outer, inner))
            })?;
        }
        Ok(out)
    }

    /// Check the shape invariants lowering relies on.
    pub fn validate(&self) -> Result<(), LowerError> {
        for (i, s) in self.scopes.iter().enumerate() {
            if s.id.index() != i {
                return Err(LowerError::structural(format!(
                    "scope at position {} has id {}",
                    i, s.id
                )));
            }
            match s.parent {
                Some(p) => {
                    if p.0 >= s.id.0 {
                        return Err(LowerError::structural(format!(
                            "scope {} does not follow its parent {}",
                            s.id, p
                        )));
                    }
                    let parent = self.scope(p)?;
                    if s.depth != parent.depth + 1 {
                        return Err(LowerError::structural(format!(
                            "scope {} has depth {} under parent depth {}",
                            s.id, s.depth, parent.depth
                        )));
                    }
                }
                None => {
                    if s.kind != ScopeKind::Function {
                        return Err(LowerError::structural(format!(
                            "root scope {} is not a function scope",
                            s.id
                        )));
                    }
                }
            }
            if s.kind == ScopeKind::Closure {
                let c = s.closure.ok_or_else(|| {
                    LowerError::structural(format!("closure scope {} has no closure", s.id))
                })?;
                if self.closure(c)?.scope != s.id {
                    return Err(LowerError::structural(format!(
                        "closure {} does not own scope {}",
                        c, s.id
                    )));
                }
            }
        }

        for v in &self.vars {
            self.scope(v.scope)?;
        }

        for c in &self.closures {
            let scope = self.scope(c.scope)?;
            if scope.parent != Some(c.declared_in) {
                return Err(LowerError::structural(format!(
                    "closure {} is not declared in the parent of its scope",
                    c.id
                )));
            }
            for &v in &c.free_vars {
                let var = self.var(v)?;
                if !self.is_strict_ancestor(var.scope, c.scope) {
                    return Err(LowerError::structural(format!(
                        "capture '{}' of closure {} is not declared in an enclosing scope",
                        var.name, c.id
                    )));
                }
            }
        }

        for f in &self.fns {
            if self.scope(f.scope)?.kind != ScopeKind::Function {
                return Err(LowerError::structural(format!(
                    "function '{}' is not rooted at a function scope",
                    f.name
                )));
            }
        }
        Ok(())
    }
}
