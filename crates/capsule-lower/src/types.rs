//! Static types carried by variables and environment fields.

use capsule_ast::ast::{Lit, TypeExpr};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    Int,
    Bool,
    Str,
    Unit,
    /// Type parameter of the enclosing function (`T` in `fn f<T>`).
    Param(String),
    /// Named type the binder does not know about.
    Named(String),
    Fn {
        params: Vec<Ty>,
        ret: Box<Ty>,
    },
    /// Reference to a synthesized environment type (parent links, lambda
    /// environment parameters).
    Env(String),
    /// Opaque object slot (generation expansion field).
    Object,
    /// Not annotated and not inferable from the initializer.
    Unknown,
}

impl Ty {
    pub fn fun(params: Vec<Ty>, ret: Ty) -> Self {
        Ty::Fn {
            params,
            ret: Box::new(ret),
        }
    }

    /// Resolve a surface annotation. `generics` are the type parameters in
    /// scope.
    pub fn from_annotation(te: &TypeExpr, generics: &[String]) -> Ty {
        match te {
            TypeExpr::Path(id) => match id.text.as_str() {
                "Int" => Ty::Int,
                "Bool" => Ty::Bool,
                "Str" | "String" => Ty::Str,
                "Unit" => Ty::Unit,
                other if generics.iter().any(|g| g == other) => Ty::Param(other.to_string()),
                other => Ty::Named(other.to_string()),
            },
            TypeExpr::Arrow { params, ret, .. } => Ty::fun(
                params
                    .iter()
                    .map(|p| Ty::from_annotation(p, generics))
                    .collect(),
                Ty::from_annotation(ret, generics),
            ),
        }
    }

    pub fn of_lit(lit: &Lit) -> Ty {
        match lit {
            Lit::Int(_) => Ty::Int,
            Lit::Str(_) => Ty::Str,
            Lit::Bool(_) => Ty::Bool,
            Lit::Nil => Ty::Unit,
        }
    }

    /// True if the type mentions a type parameter anywhere.
    pub fn is_generic(&self) -> bool {
        match self {
            Ty::Param(_) => true,
            Ty::Fn { params, ret } => params.iter().any(Ty::is_generic) || ret.is_generic(),
            _ => false,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Int => write!(f, "Int"),
            Ty::Bool => write!(f, "Bool"),
            Ty::Str => write!(f, "Str"),
            Ty::Unit => write!(f, "Unit"),
            Ty::Param(name) | Ty::Named(name) => write!(f, "{}", name),
            Ty::Fn { params, ret } => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ret)
            }
            Ty::Env(name) => write!(f, "&{}", name),
            Ty::Object => write!(f, "Object"),
            Ty::Unknown => write!(f, "_"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_ast::ast::Ident;
    use capsule_ast::span::Span;

    fn path(name: &str) -> TypeExpr {
        TypeExpr::Path(Ident {
            text: name.into(),
            span: Span { start: 0, end: 0 },
        })
    }

    #[test]
    fn annotation_resolves_generics() {
        let generics = vec!["T".to_string()];
        assert_eq!(Ty::from_annotation(&path("T"), &generics), Ty::Param("T".into()));
        assert_eq!(Ty::from_annotation(&path("Int"), &generics), Ty::Int);
        assert_eq!(
            Ty::from_annotation(&path("Point"), &generics),
            Ty::Named("Point".into())
        );
    }

    #[test]
    fn fn_type_display() {
        let t = Ty::fun(vec![Ty::Int, Ty::Param("T".into())], Ty::Bool);
        assert_eq!(t.to_string(), "fn(Int, T) -> Bool");
        assert!(t.is_generic());
        assert_eq!(Ty::Unknown.to_string(), "_");
    }
}
