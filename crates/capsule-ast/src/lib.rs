pub mod span {
    use serde::Serialize;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
    pub struct Span {
        pub start: u32,
        pub end: u32,
    }

    impl Span {
        pub fn to(self, other: Span) -> Span {
            Span {
                start: self.start,
                end: other.end,
            }
        }
    }
}

pub mod ast {
    use super::span::Span;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    pub struct Module {
        pub items: Vec<Item>,
        pub span: Span,
    }

    #[derive(Debug, Clone, Serialize)]
    pub enum Item {
        /// Module-level binding. Lives for the whole program, never captured.
        Let(LetDecl),
        Fn(FnDecl),
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct FnDecl {
        pub name: Ident,
        /// Type parameters: `fn apply<T>(x: T)`
        pub generics: Vec<Ident>,
        pub params: Vec<Param>,
        pub ret_ty: Option<TypeExpr>,
        pub body: Block,
        pub span: Span,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct Param {
        pub name: Ident,
        pub ty: Option<TypeExpr>,
        pub span: Span,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct LetDecl {
        pub mutable: bool,
        pub name: Ident,
        pub ty: Option<TypeExpr>,
        pub value: Expr,
        pub span: Span,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct Ident {
        pub text: String,
        pub span: Span,
    }

    #[derive(Debug, Clone, Serialize)]
    pub enum TypeExpr {
        Path(Ident),
        Arrow {
            // fn(A, B, C) -> R
            params: Vec<TypeExpr>,
            ret: Box<TypeExpr>,
            span: Span,
        },
    }

    /// `{ stmt* tail? }`
    #[derive(Debug, Clone, Serialize)]
    pub struct Block {
        pub stmts: Vec<Stmt>,
        pub tail: Option<Box<Expr>>,
        pub span: Span,
    }

    #[derive(Debug, Clone, Serialize)]
    pub enum Stmt {
        Let {
            mutable: bool,
            name: Ident,
            ty: Option<TypeExpr>,
            value: Expr,
            span: Span,
        },
        Assign {
            target: Ident,
            value: Expr,
            span: Span,
        },
        Expr {
            expr: Expr,
            span: Span,
        },
        Return {
            value: Option<Expr>,
            span: Span,
        },
    }

    /// `|a: Int, b| body` or `|| body`
    #[derive(Debug, Clone, Serialize)]
    pub struct ClosureExpr {
        pub params: Vec<Param>,
        pub body: Box<Expr>,
        pub span: Span,
    }

    #[derive(Debug, Clone, Serialize)]
    pub enum Expr {
        Lit(Lit, Span),
        Var(Ident),
        Unary {
            op: UnOp,
            expr: Box<Expr>,
            span: Span,
        },
        Call {
            callee: Box<Expr>,
            args: Vec<Expr>,
            span: Span,
        },
        Binary {
            lhs: Box<Expr>,
            op: BinOp,
            rhs: Box<Expr>,
            span: Span,
        },
        Paren {
            inner: Box<Expr>,
            span: Span,
        },
        Block(Block),
        If {
            cond: Box<Expr>,
            then_: Block,
            else_: Option<Box<Expr>>,
            span: Span,
        },
        While {
            cond: Box<Expr>,
            body: Block,
            span: Span,
        },
        Closure(ClosureExpr),
    }

    impl Expr {
        pub fn span(&self) -> Span {
            match self {
                Expr::Lit(_, span) => *span,
                Expr::Var(id) => id.span,
                Expr::Unary { span, .. }
                | Expr::Call { span, .. }
                | Expr::Binary { span, .. }
                | Expr::Paren { span, .. }
                | Expr::If { span, .. }
                | Expr::While { span, .. } => *span,
                Expr::Block(block) => block.span,
                Expr::Closure(closure) => closure.span,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum UnOp {
        Not,
        Neg,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub enum Lit {
        Int(i64),
        Str(String),
        Bool(bool),
        Nil,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum BinOp {
        // logical
        Or,
        And,
        // equality
        Eq,
        Ne,
        // relational
        Lt,
        Le,
        Gt,
        Ge,
        // arithmetic
        Add,
        Sub,
        Mul,
        Div,
    }

    impl BinOp {
        pub fn symbol(self) -> &'static str {
            match self {
                BinOp::Or => "||",
                BinOp::And => "&&",
                BinOp::Eq => "==",
                BinOp::Ne => "!=",
                BinOp::Lt => "<",
                BinOp::Le => "<=",
                BinOp::Gt => ">",
                BinOp::Ge => ">=",
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
            }
        }
    }

    impl UnOp {
        pub fn symbol(self) -> &'static str {
            match self {
                UnOp::Not => "!",
                UnOp::Neg => "-",
            }
        }
    }
}
