use capsule_ast::span::Span;

/// Token kinds. Variant names show up in parse errors through `Debug`
/// (`expected Semicolon, found Eof`).
#[derive(Debug, Clone, PartialEq)]
pub enum TokKind {
    Ident(String),
    Int(i64),
    Str(String),

    KwFn,
    KwLet,
    KwMut,
    KwIf,
    KwElse,
    KwWhile,
    KwReturn,
    KwTrue,
    KwFalse,
    KwNil,

    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Arrow,
    /// Delimits closure parameter lists.
    Pipe,
    /// Logical or, or an empty closure parameter list in prefix position.
    OrOr,
    AndAnd,
    Bang,

    Eq,
    EqEq,
    BangEq,
    /// Also opens a type parameter list.
    Lt,
    Le,
    Gt,
    Ge,

    Plus,
    Minus,
    Star,
    Slash,

    /// Malformed input; the message is reported when the parser reaches it.
    Error(String),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Tok {
    pub kind: TokKind,
    pub span: Span,
}
