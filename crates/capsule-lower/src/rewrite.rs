//! Rewrite wiring: lower bound bodies so that captured variables are read and
//! written through environment fields, scope entries bring environments into
//! existence, and closure literals become `MakeClosure` over the right
//! environment.
//!
//! The rewrite builds a fresh [`LoweredUnit`]; nothing is produced unless the
//! whole unit succeeds.

use crate::error::LowerError;
use crate::hir::{HirBlock, HirExpr, HirStmt, Target};
use crate::lir::{
    Block, CaptureAccess, EnvAlloc, EnvOperand, EnvRef, Expr, Function, Global, Lambda,
    LoweredUnit, Param, Place, PlaceRoot, Stmt,
};
use crate::naming::env_local_name;
use crate::plan::{ClosureBinding, EnvironmentPlan, PlanId, Representation};
use crate::scope::{ClosureId, ClosureInfo, FnInfo, ScopeId, ScopeTree, VarId};
use crate::synth::Synthesis;

pub(crate) fn rewrite_unit(
    tree: &ScopeTree,
    plan: &EnvironmentPlan,
    synthesis: Synthesis,
) -> Result<LoweredUnit, LowerError> {
    let rw = Rewriter {
        tree,
        plan,
        synth: &synthesis,
    };

    let mut functions = Vec::new();
    for f in tree.fns.iter().filter(|f| !f.synthetic) {
        functions.push(rw.function(f)?);
    }

    let mut globals = Vec::new();
    if let Some(module) = tree.fns.iter().find(|f| f.synthetic) {
        let cx = BodyCx {
            body: module.scope,
            env_param: None,
        };
        for g in &tree.globals {
            globals.push(Global {
                name: g.name.clone(),
                mutable: g.mutable,
                init: rw.expr(&cx, &g.init)?,
            });
        }
    }

    let mut lambdas = Vec::new();
    let mut captures = Vec::new();
    for c in &tree.closures {
        let (lambda, access) = rw.lambda(c)?;
        lambdas.push(lambda);
        captures.extend(access);
    }

    let Synthesis {
        generation,
        envs,
        report,
        carried,
        history,
        ..
    } = synthesis;
    Ok(LoweredUnit {
        unit: tree.unit.clone(),
        generation,
        envs,
        functions,
        lambdas,
        globals,
        captures,
        report,
        carried,
        history,
    })
}

/// The body being lowered: a function or a lambda.
struct BodyCx {
    body: ScopeId,
    /// Environment the lambda is created with, when it has one.
    env_param: Option<PlanId>,
}

struct Rewriter<'a> {
    tree: &'a ScopeTree,
    plan: &'a EnvironmentPlan,
    synth: &'a Synthesis,
}

impl Rewriter<'_> {
    // -----------------------------------------------------------------------
    // Access paths
    // -----------------------------------------------------------------------

    fn env_ref(&self, cx: &BodyCx, p: PlanId) -> Result<EnvRef, LowerError> {
        let target = self.plan.plan(p)?;
        let env = self.synth.env(p)?.name.clone();
        if let Some(origin) = target.origin {
            if self.tree.body_of(origin)? == cx.body {
                return Ok(EnvRef {
                    root: PlaceRoot::Local(env_local_name(p.0)),
                    hops: Vec::new(),
                    env,
                });
            }
        }
        let direct = cx.env_param.ok_or_else(|| {
            LowerError::structural(format!(
                "environment {} is not reachable from body {}",
                env, cx.body
            ))
        })?;
        let mut hops = Vec::new();
        for h in self.plan.hops(direct, p)? {
            hops.push(self.synth.env(h)?.name.clone());
        }
        Ok(EnvRef {
            root: PlaceRoot::EnvParam,
            hops,
            env,
        })
    }

    fn place(&self, cx: &BodyCx, v: VarId) -> Result<Option<Place>, LowerError> {
        let Some(&p) = self.plan.var_plan.get(&v) else {
            return Ok(None);
        };
        let field = self
            .synth
            .env(p)?
            .field_for(v)
            .ok_or_else(|| {
                LowerError::structural(format!("environment of {} has no field for it", v))
            })?
            .name
            .clone();
        Ok(Some(Place {
            env: self.env_ref(cx, p)?,
            field,
        }))
    }

    fn local(&self, v: VarId) -> Result<Expr, LowerError> {
        Ok(Expr::Local {
            var: v,
            name: self.tree.var(v)?.name.clone(),
        })
    }

    /// Environment entry for `scope`, if it originates a plan. `params` are
    /// the scope's parameters, whose values are known on entry.
    fn enter(
        &self,
        cx: &BodyCx,
        scope: ScopeId,
        params: &[VarId],
    ) -> Result<Option<Stmt>, LowerError> {
        let Some(&p) = self.plan.scope_plan.get(&scope) else {
            return Ok(None);
        };
        let plan = self.plan.plan(p)?;
        if plan.origin != Some(scope) {
            return Ok(None);
        }
        let env = self.synth.env(p)?;
        let mut args = Vec::new();
        for f in &env.fields {
            let Some(v) = f.var else { continue };
            if params.contains(&v) {
                args.push(self.local(v)?);
            } else {
                args.push(Expr::Uninit);
            }
        }
        let parent = match plan.parent {
            Some(pp) => Some(self.env_ref(cx, pp)?),
            None => None,
        };
        Ok(Some(Stmt::EnterEnv {
            plan: p,
            env: env.name.clone(),
            local: env_local_name(p.0),
            kind: match plan.repr {
                Representation::Reference => EnvAlloc::Alloc,
                Representation::Value => EnvAlloc::StackDecl,
            },
            args,
            parent,
        }))
    }

    // -----------------------------------------------------------------------
    // Bodies
    // -----------------------------------------------------------------------

    fn function(&self, f: &FnInfo) -> Result<Function, LowerError> {
        let cx = BodyCx {
            body: f.scope,
            env_param: None,
        };
        let mut body = self.block(&cx, &f.body)?;
        if let Some(enter) = self.enter(&cx, f.scope, &f.params)? {
            body.stmts.insert(0, enter);
        }
        Ok(Function {
            name: f.name.clone(),
            params: self.params(&f.params)?,
            body,
        })
    }

    fn lambda(&self, c: &ClosureInfo) -> Result<(Lambda, Vec<CaptureAccess>), LowerError> {
        let binding = self.binding(c.id)?;
        let env_param = match binding {
            ClosureBinding::Direct(p) => Some(p),
            ClosureBinding::Singleton(_) | ClosureBinding::Fresh(_) => None,
        };
        let cx = BodyCx {
            body: c.scope,
            env_param,
        };
        let mut body = match &c.body {
            HirExpr::Block(b) if b.scope.is_none() => self.block(&cx, b)?,
            other => Block {
                stmts: Vec::new(),
                tail: Some(Box::new(self.expr(&cx, other)?)),
            },
        };
        if let Some(enter) = self.enter(&cx, c.scope, &c.params)? {
            body.stmts.insert(0, enter);
        }

        let name = self.lambda_name(c.id)?;
        let mut access = Vec::with_capacity(c.free_vars.len());
        for &v in &c.free_vars {
            let path = self.place(&cx, v)?.ok_or_else(|| {
                LowerError::structural(format!("free variable {} of {} has no environment", v, c.id))
            })?;
            access.push(CaptureAccess {
                closure: c.id,
                lambda: name.clone(),
                var: v,
                name: self.tree.var(v)?.name.clone(),
                path,
            });
        }

        let env = self.synth.env(binding.plan())?;
        Ok((
            Lambda {
                name,
                closure: c.id,
                env: env.name.clone(),
                env_kind: env.kind,
                params: self.params(&c.params)?,
                body,
            },
            access,
        ))
    }

    fn params(&self, vars: &[VarId]) -> Result<Vec<Param>, LowerError> {
        vars.iter()
            .map(|&v| {
                Ok(Param {
                    var: v,
                    name: self.tree.var(v)?.name.clone(),
                })
            })
            .collect()
    }

    fn binding(&self, c: ClosureId) -> Result<ClosureBinding, LowerError> {
        self.plan
            .bindings
            .get(&c)
            .copied()
            .ok_or_else(|| LowerError::structural(format!("closure {} has no environment binding", c)))
    }

    fn lambda_name(&self, c: ClosureId) -> Result<String, LowerError> {
        self.synth
            .lambda_names
            .get(&c)
            .cloned()
            .ok_or_else(|| LowerError::structural(format!("closure {} has no lambda name", c)))
    }

    fn block(&self, cx: &BodyCx, hb: &HirBlock) -> Result<Block, LowerError> {
        let mut stmts = Vec::with_capacity(hb.stmts.len() + 1);
        if let Some(scope) = hb.scope {
            if let Some(enter) = self.enter(cx, scope, &[])? {
                stmts.push(enter);
            }
        }
        for s in &hb.stmts {
            stmts.push(self.stmt(cx, s)?);
        }
        let tail = match &hb.tail {
            Some(t) => Some(Box::new(self.expr(cx, t)?)),
            None => None,
        };
        Ok(Block { stmts, tail })
    }

    fn stmt(&self, cx: &BodyCx, s: &HirStmt) -> Result<Stmt, LowerError> {
        match s {
            HirStmt::Let { var, value } => {
                let value = self.expr(cx, value)?;
                match self.place(cx, *var)? {
                    Some(place) => Ok(Stmt::Store { place, value }),
                    None => Ok(Stmt::Let {
                        var: *var,
                        name: self.tree.var(*var)?.name.clone(),
                        value,
                    }),
                }
            }
            HirStmt::Assign { target, value } => {
                let value = self.expr(cx, value)?;
                match target {
                    Target::Local(var) => match self.place(cx, *var)? {
                        Some(place) => Ok(Stmt::Store { place, value }),
                        None => Ok(Stmt::Assign {
                            var: *var,
                            name: self.tree.var(*var)?.name.clone(),
                            value,
                        }),
                    },
                    Target::Global(name) => Ok(Stmt::AssignGlobal {
                        name: name.clone(),
                        value,
                    }),
                }
            }
            HirStmt::Expr(e) => Ok(Stmt::Expr(self.expr(cx, e)?)),
            HirStmt::Return(e) => match e {
                Some(e) => Ok(Stmt::Return(Some(self.expr(cx, e)?))),
                None => Ok(Stmt::Return(None)),
            },
        }
    }

    fn expr(&self, cx: &BodyCx, e: &HirExpr) -> Result<Expr, LowerError> {
        Ok(match e {
            HirExpr::Lit(l) => Expr::Lit(l.clone()),
            HirExpr::Local(v) => match self.place(cx, *v)? {
                Some(place) => Expr::Load(place),
                None => self.local(*v)?,
            },
            HirExpr::Global(g) => Expr::Global(g.clone()),
            HirExpr::Fn(name) => Expr::Fn(name.clone()),
            HirExpr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Box::new(self.expr(cx, expr)?),
            },
            HirExpr::Binary { lhs, op, rhs } => Expr::Binary {
                lhs: Box::new(self.expr(cx, lhs)?),
                op: *op,
                rhs: Box::new(self.expr(cx, rhs)?),
            },
            HirExpr::Call { callee, args } => {
                let mut out = Vec::with_capacity(args.len());
                for a in args {
                    out.push(self.expr(cx, a)?);
                }
                Expr::Call {
                    callee: Box::new(self.expr(cx, callee)?),
                    args: out,
                }
            }
            HirExpr::Block(b) => Expr::Block(self.block(cx, b)?),
            HirExpr::If { cond, then_, else_ } => Expr::If {
                cond: Box::new(self.expr(cx, cond)?),
                then_: self.block(cx, then_)?,
                else_: match else_ {
                    Some(e) => Some(Box::new(self.expr(cx, e)?)),
                    None => None,
                },
            },
            HirExpr::While { cond, body } => Expr::While {
                cond: Box::new(self.expr(cx, cond)?),
                body: self.block(cx, body)?,
            },
            HirExpr::Closure(c) => {
                let lambda = self.lambda_name(*c)?;
                let env = match self.binding(*c)? {
                    ClosureBinding::Direct(p) => EnvOperand::Ref(self.env_ref(cx, p)?),
                    ClosureBinding::Singleton(p) => {
                        EnvOperand::Singleton(self.synth.env(p)?.name.clone())
                    }
                    ClosureBinding::Fresh(p) => EnvOperand::Fresh(self.synth.env(p)?.name.clone()),
                };
                Expr::MakeClosure { lambda, env }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::lir::{EnvOperand, Expr, PlaceRoot, Stmt};
    use crate::{bind_module, lower_unit, LowerOptions, LoweredUnit};
    use capsule_parse::parse_str;

    fn lower(src: &str) -> LoweredUnit {
        let m = parse_str("<test>", src).expect("parse failed");
        let tree = bind_module(&m, "test").expect("bind failed");
        lower_unit(&tree, &LowerOptions::default(), None).expect("lowering failed")
    }

    #[test]
    fn captured_let_becomes_store() {
        let u = lower("fn main() { let x = 1; let f = || x; f() }");
        let main = u.function("main").expect("main");
        assert!(matches!(main.body.stmts[0], Stmt::EnterEnv { .. }));
        let Stmt::Store { place, .. } = &main.body.stmts[1] else {
            panic!("expected store, got {:?}", main.body.stmts[1]);
        };
        assert_eq!(place.field, "x");
        assert_eq!(place.env.root, PlaceRoot::Local("<>locals0".into()));
        // the original declaration is gone
        assert!(!main
            .body
            .stmts
            .iter()
            .any(|s| matches!(s, Stmt::Let { name, .. } if name == "x")));
    }

    #[test]
    fn captured_param_is_passed_on_entry() {
        let u = lower("fn make(n: Int) { || n }");
        let f = u.function("make").expect("make");
        let Stmt::EnterEnv { args, .. } = &f.body.stmts[0] else {
            panic!("expected env entry");
        };
        assert!(matches!(&args[0], Expr::Local { name, .. } if name == "n"));
    }

    #[test]
    fn nested_access_goes_through_parent() {
        let u = lower("fn main() { let x = 1; let f = |y| { let g = || x + y; g() }; f(2) }");
        let g = u.lambda("<main>b__1").expect("g");
        assert_eq!(g.params.len(), 0);
        let x = u
            .captures
            .iter()
            .find(|c| c.lambda == "<main>b__1" && c.name == "x")
            .expect("capture of x");
        assert_eq!(x.path.env.root, PlaceRoot::EnvParam);
        assert_eq!(x.path.env.hops, vec!["<>Env0_0".to_string()]);
        let y = u
            .captures
            .iter()
            .find(|c| c.lambda == "<main>b__1" && c.name == "y")
            .expect("capture of y");
        assert!(y.path.env.hops.is_empty());
    }

    #[test]
    fn stateless_closure_uses_singleton_operand() {
        let u = lower("fn main() { let f = || 1; f() }");
        let main = u.function("main").expect("main");
        let Stmt::Let { value, .. } = &main.body.stmts[0] else {
            panic!("expected let");
        };
        let Expr::MakeClosure { env, .. } = value else {
            panic!("expected closure");
        };
        assert_eq!(env, &EnvOperand::Singleton("<>Env".into()));
    }

    #[test]
    fn loop_body_enters_env_each_iteration() {
        let u = lower(
            "fn main() { let mut i = 0; while i < 2 { let k = i; let f = || k; f(); i = i + 1; } }",
        );
        let main = u.function("main").expect("main");
        let found = main.body.stmts.iter().any(|s| match s {
            Stmt::Expr(Expr::While { body, .. }) => {
                matches!(body.stmts.first(), Some(Stmt::EnterEnv { .. }))
            }
            _ => false,
        });
        let tail_loop = matches!(
            main.body.tail.as_deref(),
            Some(Expr::While { body, .. }) if matches!(body.stmts.first(), Some(Stmt::EnterEnv { .. }))
        );
        assert!(found || tail_loop);
    }
}
