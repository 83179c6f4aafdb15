use capsule_ast::span::Span;

/// Errors reported while binding surface syntax into a scope tree. These are
/// user-facing: the program itself is wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// Reference to a name that is neither a local, a global nor a function
    UnknownVariable { name: String, span: Span },
    /// Assignment to a binding declared without `mut`
    ImmutableAssignment { name: String, span: Span },
    /// Two functions (or a function and a global) share a name
    DuplicateItem { name: String, span: Span },
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::UnknownVariable { name, span } => {
                write!(f, "Unknown variable '{}' at {:?}", name, span)
            }
            BindError::ImmutableAssignment { name, span } => {
                write!(
                    f,
                    "Cannot assign to immutable variable '{}' at {:?}",
                    name, span
                )
            }
            BindError::DuplicateItem { name, span } => {
                write!(f, "Duplicate item '{}' at {:?}", name, span)
            }
        }
    }
}

impl std::error::Error for BindError {}

/// Errors raised by the lowering pipeline itself. Both kinds abort the whole
/// unit; no partial output is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerError {
    /// The scope tree handed to lowering is inconsistent (unresolvable
    /// capture, dangling parent, cyclic chain). Indicates an upstream bug.
    Structural { msg: String },
    /// A synthesized name clashes with an existing symbol of the unit.
    NameCollision { name: String, unit: String },
}

impl LowerError {
    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        LowerError::Structural { msg: msg.into() }
    }
}

impl std::fmt::Display for LowerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LowerError::Structural { msg } => write!(f, "internal lowering error: {}", msg),
            LowerError::NameCollision { name, unit } => write!(
                f,
                "internal lowering error: synthesized name '{}' collides with an existing symbol in unit '{}'",
                name, unit
            ),
        }
    }
}

impl std::error::Error for LowerError {}
