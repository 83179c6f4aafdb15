//! Evaluator for lowered Capsule units.
//!
//! Walks the lowered functions and lambdas directly, so every capture goes
//! through a real environment object. Reference environments are shared
//! through `Arc`. Value environments stay owned by the frame that entered
//! them: closures only get weak handles, and the environment is dropped when
//! its block finishes.

use anyhow::{anyhow, bail, Result};
use capsule_ast::ast::{BinOp, Lit, UnOp};
use capsule_lower::lir::{Block, EnvOperand, EnvRef, Expr, Function, Lambda, PlaceRoot, Stmt};
use capsule_lower::scope::VarId;
use capsule_lower::{LoweredUnit, Representation};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace};

use crate::singleton::SingletonCache;

/// Maximum call depth to prevent stack overflow from deep recursion
const MAX_CALL_DEPTH: u32 = 1000;

thread_local! {
    static CALL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub type EnvCell = Arc<Mutex<EnvObject>>;

/// A live environment instance.
#[derive(Debug)]
pub struct EnvObject {
    pub ty: String,
    slots: HashMap<String, Value>,
    parent: Option<EnvHandle>,
}

impl EnvObject {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            slots: HashMap::new(),
            parent: None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.slots.get(field)
    }
}

/// How a closure or child environment holds an environment. Parent links
/// are always `Shared`; closures over value environments are `Borrowed`.
#[derive(Clone)]
pub enum EnvHandle {
    /// Reference environment: shared ownership.
    Shared(EnvCell),
    /// Value environment: owned by the entering frame.
    Borrowed(Weak<Mutex<EnvObject>>),
}

impl EnvHandle {
    pub fn get(&self) -> Result<EnvCell> {
        match self {
            EnvHandle::Shared(cell) => Ok(cell.clone()),
            EnvHandle::Borrowed(weak) => weak
                .upgrade()
                .ok_or_else(|| anyhow!("value environment used after its scope exited")),
        }
    }
}

impl fmt::Debug for EnvHandle {
    // Environments can be cyclic through closures stored in their own slots.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvHandle::Shared(_) => write!(f, "EnvHandle::Shared"),
            EnvHandle::Borrowed(_) => write!(f, "EnvHandle::Borrowed"),
        }
    }
}

/// Runtime values
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Unit,
    /// Reference to a top-level function
    Fn(String),
    /// Lambda paired with its environment
    Closure { lambda: String, env: EnvHandle },
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Unit => write!(f, "()"),
            Value::Fn(name) => write!(f, "<fn {}>", name),
            Value::Closure { lambda, .. } => write!(f, "<closure {}>", lambda),
        }
    }
}

/// Control flow for evaluation
#[derive(Debug, Clone)]
pub enum ControlFlow {
    Value(Value),
    /// Return statement - bubbles up to the function boundary
    Return(Value),
}

impl ControlFlow {
    pub fn into_value(self) -> Value {
        match self {
            ControlFlow::Value(v) | ControlFlow::Return(v) => v,
        }
    }
}

/// Evaluate to a value or propagate a pending return.
macro_rules! value {
    ($e:expr) => {
        match $e? {
            ControlFlow::Value(v) => v,
            ret @ ControlFlow::Return(_) => return Ok(ret),
        }
    };
}

#[derive(Default)]
struct Frame {
    locals: HashMap<VarId, Value>,
    /// Environments entered in this body, by local name.
    envs: HashMap<String, EnvCell>,
    env_param: Option<EnvHandle>,
}

fn lock(cell: &EnvCell) -> Result<MutexGuard<'_, EnvObject>> {
    cell.lock()
        .map_err(|_| anyhow!("environment lock poisoned"))
}

/// Run `main()` of a lowered unit.
pub fn run_unit(unit: &LoweredUnit) -> Result<Value> {
    run_unit_with(unit, Arc::new(SingletonCache::for_unit(unit)))
}

/// Run `main()` with a caller-provided singleton cache.
pub fn run_unit_with(unit: &LoweredUnit, singletons: Arc<SingletonCache>) -> Result<Value> {
    let mut interp = Interpreter::new(unit, singletons);
    interp.init_globals()?;
    let main = unit
        .function("main")
        .ok_or_else(|| anyhow!("unit '{}' has no main function", unit.unit))?;
    if !main.params.is_empty() {
        bail!("main must not take parameters");
    }
    let result = interp.call_function(main, Vec::new())?;
    debug!(unit = %unit.unit, result = %result, "main returned");
    Ok(result)
}

pub struct Interpreter<'u> {
    unit: &'u LoweredUnit,
    globals: HashMap<String, Value>,
    kinds: HashMap<&'u str, Representation>,
    singletons: Arc<SingletonCache>,
}

impl<'u> Interpreter<'u> {
    pub fn new(unit: &'u LoweredUnit, singletons: Arc<SingletonCache>) -> Self {
        let kinds = unit
            .envs
            .iter()
            .map(|e| (e.name.as_str(), e.kind))
            .collect();
        Self {
            unit,
            globals: HashMap::new(),
            kinds,
            singletons,
        }
    }

    /// Evaluate global initializers in declaration order.
    pub fn init_globals(&mut self) -> Result<()> {
        let unit = self.unit;
        for g in &unit.globals {
            let mut frame = Frame::default();
            let v = self.expr(&mut frame, &g.init)?.into_value();
            self.globals.insert(g.name.clone(), v);
        }
        Ok(())
    }

    pub fn call(&mut self, callee: Value, args: Vec<Value>) -> Result<Value> {
        let depth = CALL_DEPTH.with(|d| {
            let n = d.get() + 1;
            d.set(n);
            n
        });
        let result = if depth > MAX_CALL_DEPTH {
            Err(anyhow!(
                "maximum call depth ({}) exceeded - possible infinite recursion",
                MAX_CALL_DEPTH
            ))
        } else {
            self.call_inner(callee, args)
        };
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        result
    }

    fn call_inner(&mut self, callee: Value, args: Vec<Value>) -> Result<Value> {
        let unit = self.unit;
        match callee {
            Value::Fn(name) => {
                let f = unit
                    .function(&name)
                    .ok_or_else(|| anyhow!("undefined function `{}`", name))?;
                self.call_function(f, args)
            }
            Value::Closure { lambda, env } => {
                let l = unit
                    .lambda(&lambda)
                    .ok_or_else(|| anyhow!("undefined lambda `{}`", lambda))?;
                self.call_lambda(l, env, args)
            }
            other => bail!("cannot call non-function value: {}", other),
        }
    }

    fn call_function(&mut self, f: &Function, args: Vec<Value>) -> Result<Value> {
        if args.len() != f.params.len() {
            bail!(
                "`{}` expects {} arguments, got {}",
                f.name,
                f.params.len(),
                args.len()
            );
        }
        let mut frame = Frame::default();
        for (p, v) in f.params.iter().zip(args) {
            frame.locals.insert(p.var, v);
        }
        Ok(self.block(&mut frame, &f.body)?.into_value())
    }

    fn call_lambda(&mut self, l: &Lambda, env: EnvHandle, args: Vec<Value>) -> Result<Value> {
        if args.len() != l.params.len() {
            bail!(
                "closure `{}` expects {} arguments, got {}",
                l.name,
                l.params.len(),
                args.len()
            );
        }
        let mut frame = Frame {
            env_param: Some(env),
            ..Frame::default()
        };
        for (p, v) in l.params.iter().zip(args) {
            frame.locals.insert(p.var, v);
        }
        Ok(self.block(&mut frame, &l.body)?.into_value())
    }

    // -----------------------------------------------------------------------
    // Environments
    // -----------------------------------------------------------------------

    fn kind_of(&self, env: &str) -> Result<Representation> {
        self.kinds
            .get(env)
            .copied()
            .ok_or_else(|| anyhow!("unknown environment type `{}`", env))
    }

    fn resolve(&self, frame: &Frame, r: &EnvRef) -> Result<EnvCell> {
        let mut cell = match &r.root {
            PlaceRoot::Local(name) => frame
                .envs
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("environment `{}` is not live", name))?,
            PlaceRoot::EnvParam => frame
                .env_param
                .as_ref()
                .ok_or_else(|| anyhow!("no environment parameter in this frame"))?
                .get()?,
        };
        for hop in &r.hops {
            let parent = {
                let env = lock(&cell)?;
                match &env.parent {
                    Some(p) => p.clone(),
                    None => bail!("environment `{}` has no parent", env.ty),
                }
            };
            cell = parent.get()?;
            trace!(to = %hop, "parent hop");
        }
        Ok(cell)
    }

    fn handle(&self, frame: &Frame, r: &EnvRef) -> Result<EnvHandle> {
        let cell = self.resolve(frame, r)?;
        Ok(match self.kind_of(&r.env)? {
            Representation::Reference => EnvHandle::Shared(cell),
            Representation::Value => EnvHandle::Borrowed(Arc::downgrade(&cell)),
        })
    }

    fn operand(&self, frame: &Frame, op: &EnvOperand) -> Result<EnvHandle> {
        match op {
            EnvOperand::Ref(r) => self.handle(frame, r),
            EnvOperand::Singleton(env) => self
                .singletons
                .instance(env)
                .map(EnvHandle::Shared)
                .ok_or_else(|| anyhow!("`{}` has no singleton accessor", env)),
            EnvOperand::Fresh(env) => Ok(EnvHandle::Shared(Arc::new(Mutex::new(
                EnvObject::new(env.clone()),
            )))),
        }
    }

    fn enter(
        &mut self,
        frame: &mut Frame,
        env: &str,
        local: &str,
        args: &[Expr],
        parent: Option<&EnvRef>,
    ) -> Result<()> {
        let unit = self.unit;
        let ty = unit
            .env(env)
            .ok_or_else(|| anyhow!("unknown environment type `{}`", env))?;
        let mut obj = EnvObject::new(env);
        let mut args = args.iter();
        for field in ty.fields.iter().filter(|f| f.var.is_some()) {
            let Some(arg) = args.next() else {
                bail!("missing initial value for `{}.{}`", env, field.name);
            };
            if matches!(arg, Expr::Uninit) {
                continue;
            }
            let v = self.expr(frame, arg)?.into_value();
            obj.slots.insert(field.name.clone(), v);
        }
        // parent links always own their parent
        if let Some(p) = parent {
            obj.parent = Some(EnvHandle::Shared(self.resolve(frame, p)?));
        }
        trace!(env = %env, local = %local, "environment entered");
        frame
            .envs
            .insert(local.to_string(), Arc::new(Mutex::new(obj)));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blocks and statements
    // -----------------------------------------------------------------------

    fn block(&mut self, frame: &mut Frame, b: &Block) -> Result<ControlFlow> {
        let mut entered = Vec::new();
        let result = self.block_inner(frame, b, &mut entered);
        // value environments end with their block
        for local in entered {
            frame.envs.remove(&local);
        }
        result
    }

    fn block_inner(
        &mut self,
        frame: &mut Frame,
        b: &Block,
        entered: &mut Vec<String>,
    ) -> Result<ControlFlow> {
        for s in &b.stmts {
            if let Stmt::EnterEnv { local, .. } = s {
                entered.push(local.clone());
            }
            if let ControlFlow::Return(v) = self.stmt(frame, s)? {
                return Ok(ControlFlow::Return(v));
            }
        }
        match &b.tail {
            Some(t) => self.expr(frame, t),
            None => Ok(ControlFlow::Value(Value::Unit)),
        }
    }

    fn stmt(&mut self, frame: &mut Frame, s: &Stmt) -> Result<ControlFlow> {
        match s {
            Stmt::EnterEnv {
                env,
                local,
                args,
                parent,
                ..
            } => self.enter(frame, env, local, args, parent.as_ref())?,
            Stmt::Store { place, value } => {
                let v = value!(self.expr(frame, value));
                let cell = self.resolve(frame, &place.env)?;
                lock(&cell)?.slots.insert(place.field.clone(), v);
            }
            Stmt::Let { var, value, .. } => {
                let v = value!(self.expr(frame, value));
                frame.locals.insert(*var, v);
            }
            Stmt::Assign { var, name, value } => {
                let v = value!(self.expr(frame, value));
                match frame.locals.get_mut(var) {
                    Some(slot) => *slot = v,
                    None => bail!("assignment to undeclared local `{}`", name),
                }
            }
            Stmt::AssignGlobal { name, value } => {
                let v = value!(self.expr(frame, value));
                match self.globals.get_mut(name) {
                    Some(slot) => *slot = v,
                    None => bail!("assignment to uninitialized global `{}`", name),
                }
            }
            Stmt::Expr(e) => {
                value!(self.expr(frame, e));
            }
            Stmt::Return(e) => {
                let v = match e {
                    Some(e) => value!(self.expr(frame, e)),
                    None => Value::Unit,
                };
                return Ok(ControlFlow::Return(v));
            }
        }
        Ok(ControlFlow::Value(Value::Unit))
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expr(&mut self, frame: &mut Frame, e: &Expr) -> Result<ControlFlow> {
        let v = match e {
            Expr::Lit(l) => match l {
                Lit::Int(v) => Value::Int(*v),
                Lit::Str(s) => Value::Str(s.clone()),
                Lit::Bool(b) => Value::Bool(*b),
                Lit::Nil => Value::Unit,
            },
            Expr::Uninit => bail!("uninitialized slot used as a value"),
            Expr::Local { var, name } => frame
                .locals
                .get(var)
                .cloned()
                .ok_or_else(|| anyhow!("local `{}` read before assignment", name))?,
            Expr::Global(name) => self
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("global `{}` read before initialization", name))?,
            Expr::Fn(name) => Value::Fn(name.clone()),
            Expr::Load(place) => {
                let cell = self.resolve(frame, &place.env)?;
                let env = lock(&cell)?;
                let v = match env.get(&place.field) {
                    Some(v) => v.clone(),
                    None => bail!("`{}.{}` read before initialization", env.ty, place.field),
                };
                v
            }
            Expr::Unary { op, expr } => {
                let v = value!(self.expr(frame, expr));
                match (op, v) {
                    (UnOp::Not, Value::Bool(b)) => Value::Bool(!b),
                    (UnOp::Neg, Value::Int(n)) => Value::Int(
                        n.checked_neg()
                            .ok_or_else(|| anyhow!("integer overflow in negation"))?,
                    ),
                    (UnOp::Not, _) => bail!("`!` expects Bool"),
                    (UnOp::Neg, _) => bail!("unary `-` expects Int"),
                }
            }
            Expr::Binary { lhs, op, rhs } => return self.binary(frame, *op, lhs, rhs),
            Expr::Call { callee, args } => {
                let callee = value!(self.expr(frame, callee));
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(value!(self.expr(frame, a)));
                }
                self.call(callee, vals)?
            }
            Expr::If { cond, then_, else_ } => {
                return match value!(self.expr(frame, cond)) {
                    Value::Bool(true) => self.block(frame, then_),
                    Value::Bool(false) => match else_ {
                        Some(e) => self.expr(frame, e),
                        None => Ok(ControlFlow::Value(Value::Unit)),
                    },
                    _ => bail!("if condition must be Bool"),
                };
            }
            Expr::Block(b) => return self.block(frame, b),
            Expr::While { cond, body } => {
                loop {
                    match value!(self.expr(frame, cond)) {
                        Value::Bool(true) => {}
                        Value::Bool(false) => break,
                        _ => bail!("while condition must be Bool"),
                    }
                    if let ControlFlow::Return(v) = self.block(frame, body)? {
                        return Ok(ControlFlow::Return(v));
                    }
                }
                Value::Unit
            }
            Expr::MakeClosure { lambda, env } => Value::Closure {
                lambda: lambda.clone(),
                env: self.operand(frame, env)?,
            },
        };
        Ok(ControlFlow::Value(v))
    }

    fn binary(&mut self, frame: &mut Frame, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<ControlFlow> {
        let l = value!(self.expr(frame, lhs));
        match op {
            BinOp::And | BinOp::Or => {
                let Value::Bool(a) = l else {
                    bail!("{} expects Bool", op.symbol());
                };
                if (op == BinOp::And && !a) || (op == BinOp::Or && a) {
                    return Ok(ControlFlow::Value(Value::Bool(a)));
                }
                return match value!(self.expr(frame, rhs)) {
                    Value::Bool(b) => Ok(ControlFlow::Value(Value::Bool(b))),
                    _ => bail!("{} expects Bool", op.symbol()),
                };
            }
            _ => {}
        }
        let r = value!(self.expr(frame, rhs));
        let v = match (op, l, r) {
            (BinOp::Eq, a, b) => Value::Bool(equal(&a, &b)?),
            (BinOp::Ne, a, b) => Value::Bool(!equal(&a, &b)?),
            (BinOp::Add, Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
            (op, Value::Int(a), Value::Int(b)) => match op {
                BinOp::Lt => Value::Bool(a < b),
                BinOp::Le => Value::Bool(a <= b),
                BinOp::Gt => Value::Bool(a > b),
                BinOp::Ge => Value::Bool(a >= b),
                BinOp::Add => Value::Int(checked(a.checked_add(b))?),
                BinOp::Sub => Value::Int(checked(a.checked_sub(b))?),
                BinOp::Mul => Value::Int(checked(a.checked_mul(b))?),
                BinOp::Div => {
                    if b == 0 {
                        bail!("division by zero");
                    }
                    Value::Int(checked(a.checked_div(b))?)
                }
                _ => bail!("`{}` does not apply to Int", op.symbol()),
            },
            (op, a, b) => bail!("`{}` cannot combine {} and {}", op.symbol(), a, b),
        };
        Ok(ControlFlow::Value(v))
    }
}

fn checked(v: Option<i64>) -> Result<i64> {
    v.ok_or_else(|| anyhow!("integer overflow"))
}

fn equal(a: &Value, b: &Value) -> Result<bool> {
    Ok(match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Unit, Value::Unit) => true,
        (Value::Fn(x), Value::Fn(y)) => x == y,
        _ => bail!("cannot compare {} with {}", a, b),
    })
}
