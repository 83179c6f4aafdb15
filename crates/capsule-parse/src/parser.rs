//! Recursive descent over items and statements, with a binding-power loop
//! for binary operators and call application.

use crate::lexer::Lexer;
use crate::token::{Tok, TokKind};
use anyhow::{anyhow, Result};
use capsule_ast::ast::{
    BinOp, Block, ClosureExpr, Expr, FnDecl, Ident, Item, LetDecl, Lit, Module, Param, Stmt,
    TypeExpr, UnOp,
};
use capsule_ast::span::Span;

/// Maximum nesting depth of expressions/blocks before the parser gives up.
pub const MAX_NESTING_DEPTH: u32 = 256;

/// Binding power of prefix `!` and `-`.
const PREFIX_BP: u8 = 100;

pub fn parse_str(file: &str, src: &str) -> Result<Module> {
    Parser::new(file, src).module()
}

/// Left binding power of an infix operator; right power is one higher, so
/// every level associates to the left.
fn infix(kind: &TokKind) -> Option<(BinOp, u8)> {
    let entry = match kind {
        TokKind::OrOr => (BinOp::Or, 1),
        TokKind::AndAnd => (BinOp::And, 3),
        TokKind::EqEq => (BinOp::Eq, 5),
        TokKind::BangEq => (BinOp::Ne, 5),
        TokKind::Lt => (BinOp::Lt, 7),
        TokKind::Le => (BinOp::Le, 7),
        TokKind::Gt => (BinOp::Gt, 7),
        TokKind::Ge => (BinOp::Ge, 7),
        TokKind::Plus => (BinOp::Add, 10),
        TokKind::Minus => (BinOp::Sub, 10),
        TokKind::Star => (BinOp::Mul, 20),
        TokKind::Slash => (BinOp::Div, 20),
        _ => return None,
    };
    Some(entry)
}

fn type_span(t: &TypeExpr) -> Span {
    match t {
        TypeExpr::Path(id) => id.span,
        TypeExpr::Arrow { span, .. } => *span,
    }
}

/// `while`, `if` and bare blocks end in `}` and may stand as statements
/// without a trailing `;`.
fn ends_with_block(e: &Expr) -> bool {
    matches!(e, Expr::While { .. } | Expr::If { .. } | Expr::Block(_))
}

/// One entry of a block body.
enum Entry {
    Stmt(Stmt),
    Tail(Expr),
}

struct Parser<'src> {
    file: &'src str,
    lexer: Lexer<'src>,
    tok: Tok,
    depth: u32,
}

impl<'src> Parser<'src> {
    fn new(file: &'src str, src: &'src str) -> Self {
        let mut lexer = Lexer::new(src);
        let tok = lexer.next_tok();
        Self {
            file,
            lexer,
            tok,
            depth: 0,
        }
    }

    fn error(&self, msg: impl std::fmt::Display) -> anyhow::Error {
        anyhow!("{}:{}: {}", self.file, self.tok.span.start, msg)
    }

    /// Consumes the current token and returns it.
    fn advance(&mut self) -> Tok {
        let next = self.lexer.next_tok();
        std::mem::replace(&mut self.tok, next)
    }

    fn check(&self, kind: &TokKind) -> bool {
        std::mem::discriminant(&self.tok.kind) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokKind) -> Option<Tok> {
        self.check(kind).then(|| self.advance())
    }

    fn expect(&mut self, kind: TokKind) -> Result<Tok> {
        if let TokKind::Error(msg) = &self.tok.kind {
            return Err(self.error(format!("lex error: {}", msg)));
        }
        match self.eat(&kind) {
            Some(t) => Ok(t),
            None => Err(self.error(format!("expected {:?}, found {:?}", kind, self.tok.kind))),
        }
    }

    /// Runs `f` one nesting level deeper.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error(format!(
                "nesting depth limit of {} exceeded",
                MAX_NESTING_DEPTH
            )));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    /// Comma separated items up to, not including, `close`.
    fn comma_list<T>(
        &mut self,
        close: &TokKind,
        mut item: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        if self.check(close) {
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            if self.eat(&TokKind::Comma).is_none() {
                return Ok(items);
            }
        }
    }

    fn ident(&mut self) -> Result<Ident> {
        let TokKind::Ident(text) = &self.tok.kind else {
            return Err(self.error(format!("expected identifier, found {:?}", self.tok.kind)));
        };
        let text = text.clone();
        let span = self.advance().span;
        Ok(Ident { text, span })
    }

    fn annotation(&mut self) -> Result<Option<TypeExpr>> {
        match self.eat(&TokKind::Colon) {
            Some(_) => self.ty().map(Some),
            None => Ok(None),
        }
    }

    // items

    fn module(&mut self) -> Result<Module> {
        let start = self.tok.span.start;
        let mut items = Vec::new();
        while !self.check(&TokKind::Eof) {
            let item = match self.tok.kind {
                TokKind::KwLet => Item::Let(self.let_decl()?),
                TokKind::KwFn => Item::Fn(self.fn_decl()?),
                _ => {
                    return Err(
                        self.error(format!("unexpected token at top level: {:?}", self.tok.kind))
                    )
                }
            };
            items.push(item);
        }
        Ok(Module {
            items,
            span: Span {
                start,
                end: self.tok.span.end,
            },
        })
    }

    /// `let [mut] name [: Type] = expr;` at module or block level.
    fn let_decl(&mut self) -> Result<LetDecl> {
        let start = self.expect(TokKind::KwLet)?.span.start;
        let mutable = self.eat(&TokKind::KwMut).is_some();
        let name = self.ident()?;
        let ty = self.annotation()?;
        self.expect(TokKind::Eq)?;
        let value = self.expr()?;
        let end = self.expect(TokKind::Semicolon)?.span.end;
        Ok(LetDecl {
            mutable,
            name,
            ty,
            value,
            span: Span { start, end },
        })
    }

    /// `fn name[<T, ..>](params) [-> Type] { body }`
    fn fn_decl(&mut self) -> Result<FnDecl> {
        let start = self.expect(TokKind::KwFn)?.span.start;
        let name = self.ident()?;
        let generics = match self.eat(&TokKind::Lt) {
            Some(_) => {
                let names = self.comma_list(&TokKind::Gt, Self::ident)?;
                self.expect(TokKind::Gt)?;
                names
            }
            None => Vec::new(),
        };
        self.expect(TokKind::LParen)?;
        let params = self.comma_list(&TokKind::RParen, Self::param)?;
        self.expect(TokKind::RParen)?;
        let ret_ty = match self.eat(&TokKind::Arrow) {
            Some(_) => Some(self.ty()?),
            None => None,
        };
        let body = self.block()?;
        let span = Span {
            start,
            end: body.span.end,
        };
        Ok(FnDecl {
            name,
            generics,
            params,
            ret_ty,
            body,
            span,
        })
    }

    fn param(&mut self) -> Result<Param> {
        let name = self.ident()?;
        let ty = self.annotation()?;
        let end = ty.as_ref().map(type_span).unwrap_or(name.span).end;
        Ok(Param {
            span: Span {
                start: name.span.start,
                end,
            },
            name,
            ty,
        })
    }

    /// A type name, or `fn(A, B) -> R`.
    fn ty(&mut self) -> Result<TypeExpr> {
        let Some(kw) = self.eat(&TokKind::KwFn) else {
            return Ok(TypeExpr::Path(self.ident()?));
        };
        self.expect(TokKind::LParen)?;
        let params = self.comma_list(&TokKind::RParen, Self::ty)?;
        self.expect(TokKind::RParen)?;
        self.expect(TokKind::Arrow)?;
        let ret = self.ty()?;
        let span = kw.span.to(type_span(&ret));
        Ok(TypeExpr::Arrow {
            params,
            ret: Box::new(ret),
            span,
        })
    }

    // blocks and statements

    /// `{ stmt* tail? }`
    fn block(&mut self) -> Result<Block> {
        self.nested(|p| {
            let start = p.expect(TokKind::LBrace)?.span.start;
            let mut stmts = Vec::new();
            let mut tail = None;
            while !p.check(&TokKind::RBrace) {
                match p.entry()? {
                    Entry::Stmt(s) => stmts.push(s),
                    Entry::Tail(e) => {
                        tail = Some(Box::new(e));
                        break;
                    }
                }
            }
            let end = p.expect(TokKind::RBrace)?.span.end;
            Ok(Block {
                stmts,
                tail,
                span: Span { start, end },
            })
        })
    }

    fn entry(&mut self) -> Result<Entry> {
        match self.tok.kind {
            TokKind::KwLet => {
                let d = self.let_decl()?;
                return Ok(Entry::Stmt(Stmt::Let {
                    mutable: d.mutable,
                    name: d.name,
                    ty: d.ty,
                    value: d.value,
                    span: d.span,
                }));
            }
            TokKind::KwReturn => return self.return_stmt().map(Entry::Stmt),
            _ => {}
        }

        let expr = self.expr()?;
        let start = expr.span().start;
        if self.eat(&TokKind::Eq).is_some() {
            let Expr::Var(target) = expr else {
                return Err(self.error("assignment target must be a variable"));
            };
            let value = self.expr()?;
            let end = self.expect(TokKind::Semicolon)?.span.end;
            return Ok(Entry::Stmt(Stmt::Assign {
                target,
                value,
                span: Span { start, end },
            }));
        }
        if let Some(semi) = self.eat(&TokKind::Semicolon) {
            return Ok(Entry::Stmt(Stmt::Expr {
                expr,
                span: Span {
                    start,
                    end: semi.span.end,
                },
            }));
        }
        if self.check(&TokKind::RBrace) {
            return Ok(Entry::Tail(expr));
        }
        if ends_with_block(&expr) {
            let span = expr.span();
            return Ok(Entry::Stmt(Stmt::Expr { expr, span }));
        }
        Err(self.error(format!(
            "expected ';', '=', or '}}' after expression, found {:?}",
            self.tok.kind
        )))
    }

    /// `return [expr];`
    fn return_stmt(&mut self) -> Result<Stmt> {
        let start = self.expect(TokKind::KwReturn)?.span.start;
        let value = if self.check(&TokKind::Semicolon) {
            None
        } else {
            Some(self.expr()?)
        };
        let end = self.expect(TokKind::Semicolon)?.span.end;
        Ok(Stmt::Return {
            value,
            span: Span { start, end },
        })
    }

    // expressions

    fn expr(&mut self) -> Result<Expr> {
        self.expr_bp(0)
    }

    fn expr_bp(&mut self, min_bp: u8) -> Result<Expr> {
        self.nested(|p| {
            let mut lhs = p.prefix()?;
            loop {
                if p.check(&TokKind::LParen) {
                    lhs = p.call(lhs)?;
                    continue;
                }
                let Some((op, lbp)) = infix(&p.tok.kind) else {
                    break;
                };
                if lbp < min_bp {
                    break;
                }
                p.advance();
                let rhs = p.expr_bp(lbp + 1)?;
                let span = lhs.span().to(rhs.span());
                lhs = Expr::Binary {
                    lhs: Box::new(lhs),
                    op,
                    rhs: Box::new(rhs),
                    span,
                };
            }
            Ok(lhs)
        })
    }

    fn call(&mut self, callee: Expr) -> Result<Expr> {
        self.expect(TokKind::LParen)?;
        let args = self.comma_list(&TokKind::RParen, Self::expr)?;
        let end = self.expect(TokKind::RParen)?.span.end;
        let span = Span {
            start: callee.span().start,
            end,
        };
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            span,
        })
    }

    fn prefix(&mut self) -> Result<Expr> {
        let span = self.tok.span;
        let lit = match &self.tok.kind {
            TokKind::Int(v) => Some(Lit::Int(*v)),
            TokKind::Str(s) => Some(Lit::Str(s.clone())),
            TokKind::KwTrue => Some(Lit::Bool(true)),
            TokKind::KwFalse => Some(Lit::Bool(false)),
            TokKind::KwNil => Some(Lit::Nil),
            _ => None,
        };
        if let Some(lit) = lit {
            self.advance();
            return Ok(Expr::Lit(lit, span));
        }

        match &self.tok.kind {
            TokKind::Bang | TokKind::Minus => {
                let op = match self.advance().kind {
                    TokKind::Bang => UnOp::Not,
                    _ => UnOp::Neg,
                };
                let operand = self.expr_bp(PREFIX_BP)?;
                Ok(Expr::Unary {
                    op,
                    span: span.to(operand.span()),
                    expr: Box::new(operand),
                })
            }
            TokKind::Ident(_) => self.ident().map(Expr::Var),
            TokKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                let close = self.expect(TokKind::RParen)?;
                Ok(Expr::Paren {
                    inner: Box::new(inner),
                    span: span.to(close.span),
                })
            }
            TokKind::LBrace => self.block().map(Expr::Block),
            TokKind::KwIf => self.if_expr(),
            TokKind::KwWhile => self.while_expr(),
            TokKind::Pipe | TokKind::OrOr => self.closure(),
            TokKind::Error(msg) => Err(self.error(format!("lex error: {}", msg))),
            other => Err(self.error(format!("unexpected token in expression: {:?}", other))),
        }
    }

    /// `if cond { .. } [else if .. | else { .. }]`
    fn if_expr(&mut self) -> Result<Expr> {
        let start = self.expect(TokKind::KwIf)?.span.start;
        let cond = self.expr()?;
        let then_ = self.block()?;
        let else_ = match self.eat(&TokKind::KwElse) {
            None => None,
            Some(_) if self.check(&TokKind::KwIf) => Some(self.if_expr()?),
            Some(_) => Some(Expr::Block(self.block()?)),
        };
        let end = else_.as_ref().map(Expr::span).unwrap_or(then_.span).end;
        Ok(Expr::If {
            cond: Box::new(cond),
            then_,
            else_: else_.map(Box::new),
            span: Span { start, end },
        })
    }

    /// `while cond { body }`
    fn while_expr(&mut self) -> Result<Expr> {
        let start = self.expect(TokKind::KwWhile)?.span.start;
        let cond = self.expr()?;
        let body = self.block()?;
        let span = Span {
            start,
            end: body.span.end,
        };
        Ok(Expr::While {
            cond: Box::new(cond),
            body,
            span,
        })
    }

    /// `|a, b: Int| body` or `|| body`. The body extends as far right as
    /// an expression can.
    fn closure(&mut self) -> Result<Expr> {
        let start = self.tok.span.start;
        let params = if self.eat(&TokKind::OrOr).is_some() {
            Vec::new()
        } else {
            self.expect(TokKind::Pipe)?;
            let params = self.comma_list(&TokKind::Pipe, Self::param)?;
            self.expect(TokKind::Pipe)?;
            params
        };
        let body = self.expr()?;
        let span = Span {
            start,
            end: body.span().end,
        };
        Ok(Expr::Closure(ClosureExpr {
            params,
            body: Box::new(body),
            span,
        }))
    }
}
