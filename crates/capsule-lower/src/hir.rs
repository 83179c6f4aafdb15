//! Bound bodies: surface syntax with every name resolved to a variable, a
//! global or a function, and every closure literal replaced by its id.

use crate::scope::{ClosureId, ScopeId, VarId};
use capsule_ast::ast::{BinOp, Lit, UnOp};

#[derive(Debug, Clone)]
pub struct HirBlock {
    /// Scope introduced by this block. `None` when the block's locals live in
    /// the enclosing function or closure scope.
    pub scope: Option<ScopeId>,
    pub stmts: Vec<HirStmt>,
    pub tail: Option<Box<HirExpr>>,
}

#[derive(Debug, Clone)]
pub enum HirStmt {
    Let { var: VarId, value: HirExpr },
    Assign { target: Target, value: HirExpr },
    Expr(HirExpr),
    Return(Option<HirExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local(VarId),
    Global(String),
}

#[derive(Debug, Clone)]
pub enum HirExpr {
    Lit(Lit),
    Local(VarId),
    Global(String),
    Fn(String),
    Unary {
        op: UnOp,
        expr: Box<HirExpr>,
    },
    Binary {
        lhs: Box<HirExpr>,
        op: BinOp,
        rhs: Box<HirExpr>,
    },
    Call {
        callee: Box<HirExpr>,
        args: Vec<HirExpr>,
    },
    Block(HirBlock),
    If {
        cond: Box<HirExpr>,
        then_: HirBlock,
        else_: Option<Box<HirExpr>>,
    },
    While {
        cond: Box<HirExpr>,
        body: HirBlock,
    },
    Closure(ClosureId),
}
