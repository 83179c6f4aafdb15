//! Lowered output: functions and lambdas whose captured variables live in
//! synthesized environments.

use crate::generation::{EnvState, GenerationBaseline, GenerationReport, PriorLayout};
use crate::naming::ENV_PARAM;
use crate::plan::{PlanId, Representation};
use crate::scope::{ClosureId, VarId};
use crate::synth::EnvType;
use capsule_ast::ast::{BinOp, Lit, UnOp};
use serde::Serialize;
use std::fmt::{self, Write as _};

#[derive(Debug, Clone, Serialize)]
pub struct LoweredUnit {
    pub unit: String,
    pub generation: u32,
    pub envs: Vec<EnvType>,
    pub functions: Vec<Function>,
    pub lambdas: Vec<Lambda>,
    pub globals: Vec<Global>,
    pub captures: Vec<CaptureAccess>,
    pub report: GenerationReport,
    #[serde(skip)]
    pub(crate) carried: Vec<(String, PriorLayout)>,
    #[serde(skip)]
    pub(crate) history: Vec<(String, PriorLayout)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Param {
    pub var: VarId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Block,
}

#[derive(Debug, Clone, Serialize)]
pub struct Lambda {
    pub name: String,
    pub closure: ClosureId,
    /// Type of the environment parameter.
    pub env: String,
    pub env_kind: Representation,
    pub params: Vec<Param>,
    pub body: Block,
}

#[derive(Debug, Clone, Serialize)]
pub struct Global {
    pub name: String,
    pub mutable: bool,
    pub init: Expr,
}

/// How one closure reaches one of its captured variables.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureAccess {
    pub closure: ClosureId,
    pub lambda: String,
    pub var: VarId,
    pub name: String,
    pub path: Place,
}

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub tail: Option<Box<Expr>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnvAlloc {
    /// Heap allocation through the constructor.
    Alloc,
    /// Frame-owned value.
    StackDecl,
}

#[derive(Debug, Clone, Serialize)]
pub enum Stmt {
    /// Scope entry: bring the scope's environment into existence.
    EnterEnv {
        plan: PlanId,
        env: String,
        local: String,
        kind: EnvAlloc,
        /// Initial slot values in field order; `Uninit` until the
        /// declaration runs.
        args: Vec<Expr>,
        parent: Option<EnvRef>,
    },
    Store {
        place: Place,
        value: Expr,
    },
    Let {
        var: VarId,
        name: String,
        value: Expr,
    },
    Assign {
        var: VarId,
        name: String,
        value: Expr,
    },
    AssignGlobal {
        name: String,
        value: Expr,
    },
    Expr(Expr),
    Return(Option<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlaceRoot {
    /// Environment allocated in the current body.
    Local(String),
    /// The lambda's own environment parameter.
    EnvParam,
}

/// A reference to an environment instance: a root, then `<>parent` hops.
/// `hops` names the environment type reached by each hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvRef {
    pub root: PlaceRoot,
    pub hops: Vec<String>,
    pub env: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Place {
    pub env: EnvRef,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EnvOperand {
    Ref(EnvRef),
    /// Fetch through the singleton accessor.
    Singleton(String),
    /// Construct a new slot-less instance.
    Fresh(String),
}

#[derive(Debug, Clone, Serialize)]
pub enum Expr {
    Lit(Lit),
    Uninit,
    Local {
        var: VarId,
        name: String,
    },
    Global(String),
    Fn(String),
    Load(Place),
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    Binary {
        lhs: Box<Expr>,
        op: BinOp,
        rhs: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_: Block,
        else_: Option<Box<Expr>>,
    },
    Block(Block),
    While {
        cond: Box<Expr>,
        body: Block,
    },
    MakeClosure {
        lambda: String,
        env: EnvOperand,
    },
}

impl LoweredUnit {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn lambda(&self, name: &str) -> Option<&Lambda> {
        self.lambdas.iter().find(|l| l.name == name)
    }

    pub fn env(&self, name: &str) -> Option<&EnvType> {
        self.envs.iter().find(|e| e.name == name)
    }

    /// Baseline to hand to the next lowering of this unit.
    pub fn next_baseline(&self) -> GenerationBaseline {
        let mut b = GenerationBaseline {
            unit: self.unit.clone(),
            generation: self.generation,
            ..Default::default()
        };
        for env in &self.envs {
            b.envs
                .insert(env.identity.to_string(), PriorLayout::from_env(env));
        }
        for (identity, layout) in &self.carried {
            b.envs.insert(identity.clone(), layout.clone());
        }
        b.history = self.history.clone();
        debug_assert!(b.envs.values().all(|l| l.state == EnvState::Active));
        b
    }
}

// ---------------------------------------------------------------------------
// Pretty printing
// ---------------------------------------------------------------------------

impl fmt::Display for EnvRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            PlaceRoot::Local(name) => write!(f, "{}", name)?,
            PlaceRoot::EnvParam => write!(f, "{}", ENV_PARAM)?,
        }
        for _ in &self.hops {
            write!(f, ".{}", crate::naming::PARENT_FIELD)?;
        }
        Ok(())
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.env, self.field)
    }
}

impl fmt::Display for EnvOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvOperand::Ref(r) => write!(f, "{}", r),
            EnvOperand::Singleton(env) => {
                write!(f, "{}::{}()", env, crate::naming::INSTANCE_ACCESSOR)
            }
            EnvOperand::Fresh(env) => write!(f, "new {}()", env),
        }
    }
}

fn lit(l: &Lit) -> String {
    match l {
        Lit::Int(v) => v.to_string(),
        Lit::Str(s) => format!("{:?}", s),
        Lit::Bool(b) => b.to_string(),
        Lit::Nil => "nil".to_string(),
    }
}

struct Printer {
    out: String,
    indent: usize,
}

impl Printer {
    fn line(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(s);
        self.out.push('\n');
    }

    fn block(&mut self, b: &Block) {
        self.indent += 1;
        for s in &b.stmts {
            self.stmt(s);
        }
        if let Some(t) = &b.tail {
            let e = self.expr(t);
            self.line(&e);
        }
        self.indent -= 1;
    }

    fn stmt(&mut self, s: &Stmt) {
        match s {
            Stmt::EnterEnv {
                env,
                local,
                kind,
                args,
                parent,
                ..
            } => {
                let mut parts: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
                if let Some(p) = parent {
                    parts.push(p.to_string());
                }
                let how = match kind {
                    EnvAlloc::Alloc => "new",
                    EnvAlloc::StackDecl => "stack",
                };
                self.line(&format!(
                    "enter {} = {} {}({});",
                    local,
                    how,
                    env,
                    parts.join(", ")
                ));
            }
            Stmt::Store { place, value } => {
                let v = self.expr(value);
                self.line(&format!("{} = {};", place, v));
            }
            Stmt::Let { name, value, .. } => {
                let v = self.expr(value);
                self.line(&format!("let {} = {};", name, v));
            }
            Stmt::Assign { name, value, .. } | Stmt::AssignGlobal { name, value } => {
                let v = self.expr(value);
                self.line(&format!("{} = {};", name, v));
            }
            Stmt::Expr(e) => {
                let v = self.expr(e);
                self.line(&format!("{};", v));
            }
            Stmt::Return(e) => match e {
                Some(e) => {
                    let v = self.expr(e);
                    self.line(&format!("return {};", v));
                }
                None => self.line("return;"),
            },
        }
    }

    /// Render an expression. Block-bearing expressions are rendered inline
    /// on one line.
    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Lit(l) => lit(l),
            Expr::Uninit => "uninit".to_string(),
            Expr::Local { name, .. } => name.clone(),
            Expr::Global(g) => g.clone(),
            Expr::Fn(name) => name.clone(),
            Expr::Load(p) => p.to_string(),
            Expr::Unary { op, expr } => format!("{}{}", op.symbol(), self.expr(expr)),
            Expr::Binary { lhs, op, rhs } => {
                format!("({} {} {})", self.expr(lhs), op.symbol(), self.expr(rhs))
            }
            Expr::Call { callee, args } => {
                let args: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
                format!("{}({})", self.expr(callee), args.join(", "))
            }
            Expr::If { cond, then_, else_ } => {
                let mut s = format!("if {} {}", self.expr(cond), self.inline(then_));
                if let Some(e) = else_ {
                    let _ = write!(s, " else {}", self.expr(e));
                }
                s
            }
            Expr::Block(b) => self.inline(b),
            Expr::While { cond, body } => {
                format!("while {} {}", self.expr(cond), self.inline(body))
            }
            Expr::MakeClosure { lambda, env } => format!("closure {} with {}", lambda, env),
        }
    }

    fn inline(&self, b: &Block) -> String {
        let mut nested = Printer {
            out: String::new(),
            indent: 0,
        };
        for s in &b.stmts {
            nested.stmt(s);
        }
        let mut parts: Vec<String> = nested.out.lines().map(str::to_string).collect();
        if let Some(t) = &b.tail {
            parts.push(self.expr(t));
        }
        if parts.is_empty() {
            "{ }".to_string()
        } else {
            format!("{{ {} }}", parts.join(" "))
        }
    }
}

impl fmt::Display for LoweredUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Printer {
            out: String::new(),
            indent: 0,
        };
        p.line(&format!("unit {} generation {}", self.unit, self.generation));
        for env in &self.envs {
            p.line("");
            p.line(&format!("env {} {} [{}]", env.kind, env.name, env.identity));
            p.indent += 1;
            for field in &env.fields {
                match field.var {
                    Some(_) => p.line(&format!("field {}: {}", field.name, field.ty)),
                    None => p.line(&format!("field {}: {} (retained)", field.name, field.ty)),
                }
            }
            if let Some(x) = &env.expansion {
                p.line(&format!("field {}: {}", x.name, x.ty));
            }
            if let Some(link) = &env.parent {
                p.line(&format!("field {}: &{}", link.field, link.env));
            }
            if let Some(ctor) = &env.constructor {
                let params: Vec<String> = ctor
                    .params
                    .iter()
                    .map(|c| format!("{}: {}", c.name, c.ty))
                    .collect();
                p.line(&format!("ctor({})", params.join(", ")));
            }
            if let Some(s) = &env.singleton {
                p.line(&format!("static {}: {}", s.cache_field, env.name));
                p.line(&format!("static fn {}() -> {}", s.accessor, env.name));
            }
            p.indent -= 1;
        }
        for g in &self.globals {
            p.line("");
            let kw = if g.mutable { "let mut" } else { "let" };
            let init = p.expr(&g.init);
            p.line(&format!("{} {} = {};", kw, g.name, init));
        }
        for func in &self.functions {
            p.line("");
            let params: Vec<&str> = func.params.iter().map(|x| x.name.as_str()).collect();
            p.line(&format!("fn {}({}) {{", func.name, params.join(", ")));
            p.block(&func.body);
            p.line("}");
        }
        for l in &self.lambdas {
            p.line("");
            let mut params = vec![format!("{}: &{}", ENV_PARAM, l.env)];
            params.extend(l.params.iter().map(|x| x.name.clone()));
            p.line(&format!("lambda {}({}) {{", l.name, params.join(", ")));
            p.block(&l.body);
            p.line("}");
        }
        f.write_str(&p.out)
    }
}
