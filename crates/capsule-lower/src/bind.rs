//! Binder: turns a parsed module into a [`ScopeTree`].
//!
//! Besides resolving names, the binder records each closure's free variables
//! and a conservative escape hint. Escape is computed flow-insensitively: every
//! expression yields the set of closure values it may evaluate to, variables
//! accumulate what is stored into them, and sinks (returns, call arguments,
//! globals, block tails, outward assignments) mark what reaches them.

use crate::error::BindError;
use crate::hir::{HirBlock, HirExpr, HirStmt, Target};
use crate::scope::{
    ClosureId, ClosureInfo, FnId, FnInfo, GlobalInfo, Scope, ScopeId, ScopeKey, ScopeKind,
    ScopeTree, VarId, Variable, MODULE_FN,
};
use crate::types::Ty;
use capsule_ast::ast::{BinOp, Block, ClosureExpr, Expr, FnDecl, Item, Module, Param, Stmt, UnOp};
use capsule_ast::span::Span;
use std::collections::{BTreeMap, BTreeSet};

/// Bind `module` as the compilation unit `unit`.
pub fn bind_module(module: &Module, unit: &str) -> Result<ScopeTree, BindError> {
    let mut b = Binder::new(unit);
    b.declare_items(module)?;
    for item in &module.items {
        if let Item::Fn(fd) = item {
            b.bind_fn(fd)?;
        }
    }
    let globals: Vec<_> = module
        .items
        .iter()
        .filter_map(|it| match it {
            Item::Let(ld) => Some(ld),
            Item::Fn(_) => None,
        })
        .collect();
    if !globals.is_empty() {
        b.enter_fn(MODULE_FN, Vec::new(), module.span, true);
        for ld in globals {
            let (init, sources) = b.bind_expr(&ld.value)?;
            b.sinks.push(Sink::Escape(sources));
            let ty = match &ld.ty {
                Some(te) => Ty::from_annotation(te, &[]),
                None => b.infer(&init),
            };
            b.global_types.insert(ld.name.text.clone(), (ld.mutable, ty.clone()));
            b.globals.push(GlobalInfo {
                name: ld.name.text.clone(),
                mutable: ld.mutable,
                ty,
                init,
            });
        }
        let body = HirBlock {
            scope: None,
            stmts: Vec::new(),
            tail: None,
        };
        b.leave_fn(Vec::new(), Ty::Unit, body);
    }
    Ok(b.finish())
}

/// Something an expression may evaluate to, for escape purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Closure(ClosureId),
    Var(VarId),
}

#[derive(Debug)]
enum Sink {
    /// Everything reaching here escapes.
    Escape(Vec<Source>),
    /// Closures declared inside `scope` (inclusive) escape.
    Within { scope: ScopeId, sources: Vec<Source> },
    /// Closures declared strictly inside `scope` escape.
    Below { scope: ScopeId, sources: Vec<Source> },
}

struct Frame {
    scope: ScopeId,
    names: Vec<(String, VarId)>,
}

struct FnState {
    id: FnId,
    name: String,
    generics: Vec<String>,
    scope: ScopeId,
    closure_counter: u32,
    synthetic: bool,
}

struct Binder {
    unit: String,
    scopes: Vec<Scope>,
    child_counts: Vec<usize>,
    vars: Vec<Variable>,
    closures: Vec<ClosureInfo>,
    fns: Vec<FnInfo>,
    globals: Vec<GlobalInfo>,
    fn_types: BTreeMap<String, Ty>,
    global_types: BTreeMap<String, (bool, Ty)>,
    frames: Vec<Frame>,
    closure_stack: Vec<ClosureId>,
    current: Option<FnState>,
    // escape bookkeeping
    var_sources: Vec<Vec<Source>>,
    sinks: Vec<Sink>,
}

impl Binder {
    fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            scopes: Vec::new(),
            child_counts: Vec::new(),
            vars: Vec::new(),
            closures: Vec::new(),
            fns: Vec::new(),
            globals: Vec::new(),
            fn_types: BTreeMap::new(),
            global_types: BTreeMap::new(),
            frames: Vec::new(),
            closure_stack: Vec::new(),
            current: None,
            var_sources: Vec::new(),
            sinks: Vec::new(),
        }
    }

    fn declare_items(&mut self, module: &Module) -> Result<(), BindError> {
        let mut seen = BTreeSet::new();
        for item in &module.items {
            let name = match item {
                Item::Fn(fd) => &fd.name,
                Item::Let(ld) => &ld.name,
            };
            if !seen.insert(name.text.clone()) {
                return Err(BindError::DuplicateItem {
                    name: name.text.clone(),
                    span: name.span,
                });
            }
            match item {
                Item::Fn(fd) => {
                    let generics: Vec<String> =
                        fd.generics.iter().map(|g| g.text.clone()).collect();
                    let params = fd
                        .params
                        .iter()
                        .map(|p| annotated(p, &generics))
                        .collect();
                    let ret = fd
                        .ret_ty
                        .as_ref()
                        .map(|t| Ty::from_annotation(t, &generics))
                        .unwrap_or(Ty::Unknown);
                    self.fn_types.insert(fd.name.text.clone(), Ty::fun(params, ret));
                }
                Item::Let(ld) => {
                    let ty = ld
                        .ty
                        .as_ref()
                        .map(|t| Ty::from_annotation(t, &[]))
                        .unwrap_or(Ty::Unknown);
                    self.global_types
                        .insert(ld.name.text.clone(), (ld.mutable, ty));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scopes and declarations
    // -----------------------------------------------------------------------

    fn current_fn(&self) -> FnId {
        self.current.as_ref().map(|s| s.id).unwrap_or(FnId(0))
    }

    fn generics(&self) -> Vec<String> {
        self.current
            .as_ref()
            .map(|s| s.generics.clone())
            .unwrap_or_default()
    }

    fn new_scope(&mut self, kind: ScopeKind, span: Span) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        let parent = self.frames.last().map(|f| f.scope);
        let (key, depth) = match parent {
            Some(p) => {
                let idx = self.child_counts[p.index()];
                self.child_counts[p.index()] += 1;
                let ps = &self.scopes[p.index()];
                (ps.key.child(idx), ps.depth + 1)
            }
            None => {
                let name = self
                    .current
                    .as_ref()
                    .map(|s| s.name.as_str())
                    .unwrap_or(MODULE_FN);
                (ScopeKey::root(name), 0)
            }
        };
        self.scopes.push(Scope {
            id,
            kind,
            parent,
            key,
            owner: self.current_fn(),
            closure: None,
            depth,
            span,
        });
        self.child_counts.push(0);
        self.frames.push(Frame {
            scope: id,
            names: Vec::new(),
        });
        id
    }

    fn pop_scope(&mut self) {
        self.frames.pop();
    }

    fn current_scope(&self) -> ScopeId {
        self.frames.last().map(|f| f.scope).unwrap_or(ScopeId(0))
    }

    fn declare(&mut self, name: &str, ty: Ty, mutable: bool, is_param: bool, span: Span) -> VarId {
        let id = VarId(self.vars.len() as u32);
        let scope = self.current_scope();
        self.vars.push(Variable {
            id,
            name: name.to_string(),
            ty,
            mutable,
            scope,
            is_param,
            span,
        });
        self.var_sources.push(Vec::new());
        if let Some(frame) = self.frames.last_mut() {
            frame.names.push((name.to_string(), id));
        }
        id
    }

    fn lookup_local(&self, name: &str) -> Option<VarId> {
        self.frames.iter().rev().find_map(|f| {
            f.names
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
        })
    }

    fn is_strict_ancestor(&self, anc: ScopeId, s: ScopeId) -> bool {
        let mut cur = self.scopes[s.index()].parent;
        while let Some(id) = cur {
            if id == anc {
                return true;
            }
            cur = self.scopes[id.index()].parent;
        }
        false
    }

    /// Record a direct reference to `var` from the innermost closure.
    fn note_use(&mut self, var: VarId) {
        let Some(&c) = self.closure_stack.last() else {
            return;
        };
        let cscope = self.closures[c.index()].scope;
        let vscope = self.vars[var.index()].scope;
        if self.is_strict_ancestor(vscope, cscope) {
            let fv = &mut self.closures[c.index()].free_vars;
            if !fv.contains(&var) {
                fv.push(var);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn enter_fn(&mut self, name: &str, generics: Vec<String>, span: Span, synthetic: bool) {
        let id = FnId(self.fns.len() as u32);
        self.current = Some(FnState {
            id,
            name: name.to_string(),
            generics,
            scope: ScopeId(0),
            closure_counter: 0,
            synthetic,
        });
        let scope = self.new_scope(ScopeKind::Function, span);
        if let Some(st) = self.current.as_mut() {
            st.scope = scope;
        }
    }

    fn leave_fn(&mut self, params: Vec<VarId>, ret: Ty, body: HirBlock) {
        self.pop_scope();
        if let Some(st) = self.current.take() {
            self.fns.push(FnInfo {
                id: st.id,
                ordinal: st.id.0,
                name: st.name,
                generics: st.generics,
                scope: st.scope,
                params,
                ret,
                body,
                synthetic: st.synthetic,
            });
        }
    }

    fn bind_fn(&mut self, fd: &FnDecl) -> Result<(), BindError> {
        let generics: Vec<String> = fd.generics.iter().map(|g| g.text.clone()).collect();
        self.enter_fn(&fd.name.text, generics.clone(), fd.span, false);
        let params = self.declare_params(&fd.params, &generics);
        let (body, sources) = self.bind_block_here(&fd.body)?;
        self.sinks.push(Sink::Escape(sources));
        let ret = match &fd.ret_ty {
            Some(t) => Ty::from_annotation(t, &generics),
            None => body.tail.as_deref().map(|t| self.infer(t)).unwrap_or(Ty::Unit),
        };
        self.leave_fn(params, ret, body);
        Ok(())
    }

    fn declare_params(&mut self, params: &[Param], generics: &[String]) -> Vec<VarId> {
        params
            .iter()
            .map(|p| {
                let ty = annotated(p, generics);
                // parameters are assignable locals
                self.declare(&p.name.text, ty, true, true, p.span)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Blocks and statements
    // -----------------------------------------------------------------------

    /// Bind a block whose locals belong to the current scope.
    fn bind_block_here(&mut self, block: &Block) -> Result<(HirBlock, Vec<Source>), BindError> {
        let mut stmts = Vec::with_capacity(block.stmts.len());
        for stmt in &block.stmts {
            stmts.push(self.bind_stmt(stmt)?);
        }
        let (tail, sources) = match &block.tail {
            Some(e) => {
                let (h, s) = self.bind_expr(e)?;
                (Some(Box::new(h)), s)
            }
            None => (None, Vec::new()),
        };
        Ok((
            HirBlock {
                scope: None,
                stmts,
                tail,
            },
            sources,
        ))
    }

    /// Bind a block that opens its own scope. The tail value leaves the scope,
    /// so closures declared inside it escape.
    fn bind_scoped_block(
        &mut self,
        block: &Block,
        kind: ScopeKind,
    ) -> Result<(HirBlock, Vec<Source>), BindError> {
        let scope = self.new_scope(kind, block.span);
        let res = self.bind_block_here(block);
        self.pop_scope();
        let (mut hb, sources) = res?;
        hb.scope = Some(scope);
        self.sinks.push(Sink::Within {
            scope,
            sources: sources.clone(),
        });
        Ok((hb, sources))
    }

    fn bind_stmt(&mut self, stmt: &Stmt) -> Result<HirStmt, BindError> {
        match stmt {
            Stmt::Let {
                mutable,
                name,
                ty,
                value,
                span,
            } => {
                // initializer is resolved before the new name is visible
                let (value, sources) = self.bind_expr(value)?;
                let ty = match ty {
                    Some(t) => Ty::from_annotation(t, &self.generics()),
                    None => self.infer(&value),
                };
                let var = self.declare(&name.text, ty, *mutable, false, *span);
                self.var_sources[var.index()].extend(sources);
                Ok(HirStmt::Let { var, value })
            }
            Stmt::Assign {
                target,
                value,
                span,
            } => {
                let (value, sources) = self.bind_expr(value)?;
                if let Some(var) = self.lookup_local(&target.text) {
                    if !self.vars[var.index()].mutable {
                        return Err(BindError::ImmutableAssignment {
                            name: target.text.clone(),
                            span: *span,
                        });
                    }
                    self.note_use(var);
                    let scope = self.vars[var.index()].scope;
                    self.var_sources[var.index()].extend(sources.iter().copied());
                    self.sinks.push(Sink::Below { scope, sources });
                    return Ok(HirStmt::Assign {
                        target: Target::Local(var),
                        value,
                    });
                }
                match self.global_types.get(&target.text) {
                    Some((true, _)) => {
                        self.sinks.push(Sink::Escape(sources));
                        Ok(HirStmt::Assign {
                            target: Target::Global(target.text.clone()),
                            value,
                        })
                    }
                    Some((false, _)) => Err(BindError::ImmutableAssignment {
                        name: target.text.clone(),
                        span: *span,
                    }),
                    None if self.fn_types.contains_key(&target.text) => {
                        Err(BindError::ImmutableAssignment {
                            name: target.text.clone(),
                            span: *span,
                        })
                    }
                    None => Err(BindError::UnknownVariable {
                        name: target.text.clone(),
                        span: target.span,
                    }),
                }
            }
            Stmt::Expr { expr, .. } => {
                let (e, _) = self.bind_expr(expr)?;
                Ok(HirStmt::Expr(e))
            }
            Stmt::Return { value, .. } => match value {
                Some(v) => {
                    let (e, sources) = self.bind_expr(v)?;
                    self.sinks.push(Sink::Escape(sources));
                    Ok(HirStmt::Return(Some(e)))
                }
                None => Ok(HirStmt::Return(None)),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn bind_expr(&mut self, expr: &Expr) -> Result<(HirExpr, Vec<Source>), BindError> {
        match expr {
            Expr::Lit(lit, _) => Ok((HirExpr::Lit(lit.clone()), Vec::new())),
            Expr::Var(id) => {
                if let Some(var) = self.lookup_local(&id.text) {
                    self.note_use(var);
                    return Ok((HirExpr::Local(var), vec![Source::Var(var)]));
                }
                if self.global_types.contains_key(&id.text) {
                    return Ok((HirExpr::Global(id.text.clone()), Vec::new()));
                }
                if self.fn_types.contains_key(&id.text) {
                    return Ok((HirExpr::Fn(id.text.clone()), Vec::new()));
                }
                Err(BindError::UnknownVariable {
                    name: id.text.clone(),
                    span: id.span,
                })
            }
            Expr::Paren { inner, .. } => self.bind_expr(inner),
            Expr::Unary { op, expr, .. } => {
                let (e, _) = self.bind_expr(expr)?;
                Ok((
                    HirExpr::Unary {
                        op: *op,
                        expr: Box::new(e),
                    },
                    Vec::new(),
                ))
            }
            Expr::Binary { lhs, op, rhs, .. } => {
                let (l, _) = self.bind_expr(lhs)?;
                let (r, _) = self.bind_expr(rhs)?;
                Ok((
                    HirExpr::Binary {
                        lhs: Box::new(l),
                        op: *op,
                        rhs: Box::new(r),
                    },
                    Vec::new(),
                ))
            }
            Expr::Call { callee, args, .. } => {
                let (c, _) = self.bind_expr(callee)?;
                let mut hargs = Vec::with_capacity(args.len());
                for a in args {
                    let (h, sources) = self.bind_expr(a)?;
                    self.sinks.push(Sink::Escape(sources));
                    hargs.push(h);
                }
                Ok((
                    HirExpr::Call {
                        callee: Box::new(c),
                        args: hargs,
                    },
                    Vec::new(),
                ))
            }
            Expr::Block(b) => {
                let (hb, sources) = self.bind_scoped_block(b, ScopeKind::Block)?;
                Ok((HirExpr::Block(hb), sources))
            }
            Expr::If {
                cond, then_, else_, ..
            } => {
                let (c, _) = self.bind_expr(cond)?;
                let (t, mut sources) = self.bind_scoped_block(then_, ScopeKind::Block)?;
                let e = match else_ {
                    Some(e) => {
                        let (h, s) = self.bind_expr(e)?;
                        sources.extend(s);
                        Some(Box::new(h))
                    }
                    None => None,
                };
                Ok((
                    HirExpr::If {
                        cond: Box::new(c),
                        then_: t,
                        else_: e,
                    },
                    sources,
                ))
            }
            Expr::While { cond, body, .. } => {
                let (c, _) = self.bind_expr(cond)?;
                let scope = self.new_scope(ScopeKind::Loop, body.span);
                let res = self.bind_block_here(body);
                self.pop_scope();
                let (mut hb, _) = res?;
                hb.scope = Some(scope);
                Ok((
                    HirExpr::While {
                        cond: Box::new(c),
                        body: hb,
                    },
                    Vec::new(),
                ))
            }
            Expr::Closure(ce) => {
                let id = self.bind_closure(ce)?;
                Ok((HirExpr::Closure(id), vec![Source::Closure(id)]))
            }
        }
    }

    fn bind_closure(&mut self, ce: &ClosureExpr) -> Result<ClosureId, BindError> {
        let id = ClosureId(self.closures.len() as u32);
        let declared_in = self.current_scope();
        let owner = self.current_fn();
        let ordinal = match self.current.as_mut() {
            Some(st) => {
                st.closure_counter += 1;
                st.closure_counter - 1
            }
            None => 0,
        };
        let scope = self.new_scope(ScopeKind::Closure, ce.span);
        self.scopes[scope.index()].closure = Some(id);
        self.closures.push(ClosureInfo {
            id,
            scope,
            declared_in,
            owner,
            ordinal,
            free_vars: Vec::new(),
            escapes: false,
            params: Vec::new(),
            body: HirExpr::Lit(capsule_ast::ast::Lit::Nil),
            span: ce.span,
        });
        self.closure_stack.push(id);

        let generics = self.generics();
        let params = self.declare_params(&ce.params, &generics);
        let res = match ce.body.as_ref() {
            Expr::Block(b) => self
                .bind_block_here(b)
                .map(|(hb, s)| (HirExpr::Block(hb), s)),
            other => self.bind_expr(other),
        };

        self.closure_stack.pop();
        self.pop_scope();
        let (body, sources) = res?;
        self.sinks.push(Sink::Escape(sources));
        let info = &mut self.closures[id.index()];
        info.params = params;
        info.body = body;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------------

    fn infer(&self, e: &HirExpr) -> Ty {
        match e {
            HirExpr::Lit(l) => Ty::of_lit(l),
            HirExpr::Local(v) => self.vars[v.index()].ty.clone(),
            HirExpr::Global(g) => self
                .global_types
                .get(g)
                .map(|(_, t)| t.clone())
                .unwrap_or(Ty::Unknown),
            HirExpr::Fn(name) => self.fn_types.get(name).cloned().unwrap_or(Ty::Unknown),
            HirExpr::Unary { op, .. } => match op {
                UnOp::Not => Ty::Bool,
                UnOp::Neg => Ty::Int,
            },
            HirExpr::Binary { lhs, op, .. } => match op {
                BinOp::Add => match self.infer(lhs) {
                    Ty::Str => Ty::Str,
                    _ => Ty::Int,
                },
                BinOp::Sub | BinOp::Mul | BinOp::Div => Ty::Int,
                _ => Ty::Bool,
            },
            HirExpr::Call { callee, .. } => match self.infer(callee) {
                Ty::Fn { ret, .. } => *ret,
                _ => Ty::Unknown,
            },
            HirExpr::Block(b) => b.tail.as_deref().map(|t| self.infer(t)).unwrap_or(Ty::Unit),
            HirExpr::If { then_, .. } => then_
                .tail
                .as_deref()
                .map(|t| self.infer(t))
                .unwrap_or(Ty::Unit),
            HirExpr::While { .. } => Ty::Unit,
            HirExpr::Closure(c) => {
                let info = &self.closures[c.index()];
                let params = info
                    .params
                    .iter()
                    .map(|p| self.vars[p.index()].ty.clone())
                    .collect();
                Ty::fun(params, self.infer(&info.body))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Escape resolution
    // -----------------------------------------------------------------------

    fn finish(mut self) -> ScopeTree {
        // closures each variable may hold
        let mut holds: Vec<BTreeSet<ClosureId>> = vec![BTreeSet::new(); self.vars.len()];
        loop {
            let mut changed = false;
            for v in 0..self.vars.len() {
                let mut acc = BTreeSet::new();
                for src in &self.var_sources[v] {
                    match *src {
                        Source::Closure(c) => {
                            acc.insert(c);
                        }
                        Source::Var(w) => acc.extend(holds[w.index()].iter().copied()),
                    }
                }
                if acc.len() > holds[v].len() {
                    holds[v] = acc;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let reach = |sources: &[Source]| -> BTreeSet<ClosureId> {
            let mut out = BTreeSet::new();
            for src in sources {
                match *src {
                    Source::Closure(c) => {
                        out.insert(c);
                    }
                    Source::Var(v) => out.extend(holds[v.index()].iter().copied()),
                }
            }
            out
        };

        let mut escaping = BTreeSet::new();
        for sink in &self.sinks {
            match sink {
                Sink::Escape(sources) => escaping.extend(reach(sources)),
                Sink::Within { scope, sources } => {
                    for c in reach(sources) {
                        let d = self.closures[c.index()].declared_in;
                        if d == *scope || self.is_strict_ancestor(*scope, d) {
                            escaping.insert(c);
                        }
                    }
                }
                Sink::Below { scope, sources } => {
                    for c in reach(sources) {
                        let d = self.closures[c.index()].declared_in;
                        if self.is_strict_ancestor(*scope, d) {
                            escaping.insert(c);
                        }
                    }
                }
            }
        }

        // everything a closure needs, including what nested closures forward through it
        let mut needs: Vec<BTreeSet<VarId>> = vec![BTreeSet::new(); self.closures.len()];
        for inner in &self.closures {
            for outer in &self.closures {
                if outer.scope != inner.scope && !self.is_strict_ancestor(outer.scope, inner.scope)
                {
                    continue;
                }
                let set = &mut needs[outer.id.index()];
                for &v in &inner.free_vars {
                    let vs = self.vars[v.index()].scope;
                    if vs != outer.scope && !self.is_strict_ancestor(outer.scope, vs) {
                        set.insert(v);
                    }
                }
            }
        }

        // a closure reachable from an escaping closure's captures escapes too
        let mut work: Vec<ClosureId> = escaping.iter().copied().collect();
        while let Some(c) = work.pop() {
            for v in &needs[c.index()] {
                for &held in &holds[v.index()] {
                    if escaping.insert(held) {
                        work.push(held);
                    }
                }
            }
        }

        for c in &mut self.closures {
            c.escapes = escaping.contains(&c.id);
        }

        ScopeTree {
            unit: self.unit,
            scopes: self.scopes,
            vars: self.vars,
            closures: self.closures,
            fns: self.fns,
            globals: self.globals,
        }
    }
}

fn annotated(p: &Param, generics: &[String]) -> Ty {
    p.ty.as_ref()
        .map(|t| Ty::from_annotation(t, generics))
        .unwrap_or(Ty::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_parse::parse_str;

    fn bind(src: &str) -> ScopeTree {
        let m = parse_str("<test>", src).expect("parse failed");
        bind_module(&m, "test").expect("bind failed")
    }

    fn closure_escapes(tree: &ScopeTree, i: usize) -> bool {
        tree.closures[i].escapes
    }

    #[test]
    fn scopes_are_preorder_with_keys() {
        let t = bind("fn main() { let x = 1; { let y = 2; } while false { } }");
        let keys: Vec<_> = t.scopes.iter().map(|s| s.key.0.clone()).collect();
        assert_eq!(keys, vec!["main", "main/0", "main/1"]);
        assert_eq!(t.scopes[2].kind, ScopeKind::Loop);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn free_vars_in_first_reference_order() {
        let t = bind("fn main() { let a = 1; let b = 2; let f = |z| b + a + b + z; }");
        let names: Vec<_> = t.closures[0]
            .free_vars
            .iter()
            .map(|v| t.vars[v.index()].name.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn nested_closure_free_vars_are_direct_only() {
        let t = bind("fn main() { let x = 1; let f = || { let g = || x; g() }; }");
        assert!(t.closures[0].free_vars.is_empty());
        assert_eq!(t.closures[1].free_vars.len(), 1);
    }

    #[test]
    fn local_call_does_not_escape() {
        let t = bind("fn main() { let x = 1; let f = || x; f() }");
        assert!(!closure_escapes(&t, 0));
    }

    #[test]
    fn returned_closure_escapes() {
        let t = bind("fn make() { let x = 1; let f = || x; f }");
        assert!(closure_escapes(&t, 0));
    }

    #[test]
    fn closure_passed_as_argument_escapes() {
        let t = bind("fn apply(f) { f(1) } fn main() { let k = 2; apply(|v| v * k) }");
        assert!(closure_escapes(&t, 0));
    }

    #[test]
    fn outward_assignment_escapes() {
        let t = bind(
            "fn main() { let mut f = || 0; let x = 1; { let y = 2; f = || y; } f() }",
        );
        assert!(!closure_escapes(&t, 0));
        assert!(closure_escapes(&t, 1));
    }

    #[test]
    fn escape_is_transitive_through_captures() {
        let t = bind("fn make() { let x = 1; let inner = || x; let outer = || inner(); outer }");
        assert!(closure_escapes(&t, 0));
        assert!(closure_escapes(&t, 1));
    }

    #[test]
    fn escape_follows_captures_forwarded_to_nested_closures() {
        let t = bind(
            "fn make() { let x = 1; let mut out = || 0; \
             { let c = || x; let a = || { let b = || c(); b() }; out = a; } out }",
        );
        // c is only named inside b, which a creates
        assert!(closure_escapes(&t, 1));
        assert!(closure_escapes(&t, 2));
        assert!(!closure_escapes(&t, 3));
    }

    #[test]
    fn global_initializers_live_in_module_fn() {
        let t = bind("fn main() { 0 } let g = || 1;");
        let f = t.fns.last().expect("module fn");
        assert_eq!(f.name, MODULE_FN);
        assert!(f.synthetic);
        assert!(closure_escapes(&t, 0));
    }

    #[test]
    fn unknown_variable_is_bind_error() {
        let m = parse_str("<test>", "fn main() { y }").expect("parse failed");
        let err = bind_module(&m, "test").unwrap_err();
        assert!(matches!(err, BindError::UnknownVariable { .. }));
    }

    #[test]
    fn immutable_assignment_is_bind_error() {
        let m = parse_str("<test>", "fn main() { let x = 1; x = 2; }").expect("parse failed");
        let err = bind_module(&m, "test").unwrap_err();
        assert!(matches!(err, BindError::ImmutableAssignment { .. }));
    }

    #[test]
    fn duplicate_fn_is_bind_error() {
        let m = parse_str("<test>", "fn a() { 0 } fn a() { 1 }").expect("parse failed");
        let err = bind_module(&m, "test").unwrap_err();
        assert!(matches!(err, BindError::DuplicateItem { .. }));
    }

    #[test]
    fn let_types_are_inferred() {
        let t = bind("fn main() { let a = 1; let s = \"x\"; let b = a < 2; }");
        let tys: Vec<_> = t.vars.iter().map(|v| v.ty.clone()).collect();
        assert_eq!(tys, vec![Ty::Int, Ty::Str, Ty::Bool]);
    }
}
