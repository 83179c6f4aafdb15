use capsule_ast::ast::{BinOp, Expr, Item, UnOp};
use capsule_parse::parse_str;

fn value(src: &str) -> Expr {
    let m = parse_str("<test>", &format!("let v = {src};")).expect("parse failed");
    let Some(Item::Let(ld)) = m.items.into_iter().next() else {
        panic!("expected let item");
    };
    ld.value
}

/// Fully parenthesized rendering of an expression.
fn show(e: &Expr) -> String {
    match e {
        Expr::Lit(l, _) => format!("{:?}", l),
        Expr::Var(id) => id.text.clone(),
        Expr::Unary { op, expr, .. } => format!("{}{}", op.symbol(), show(expr)),
        Expr::Binary { lhs, op, rhs, .. } => {
            format!("({} {} {})", show(lhs), op.symbol(), show(rhs))
        }
        Expr::Call { callee, args, .. } => {
            let args: Vec<_> = args.iter().map(show).collect();
            format!("{}({})", show(callee), args.join(", "))
        }
        Expr::Paren { inner, .. } => show(inner),
        Expr::Closure(c) => {
            let params: Vec<_> = c.params.iter().map(|p| p.name.text.as_str()).collect();
            format!("|{}| {}", params.join(", "), show(&c.body))
        }
        other => format!("<{:?}>", std::mem::discriminant(other)),
    }
}

#[test]
fn arithmetic_and_comparison_levels() {
    assert_eq!(show(&value("a + b * c - d")), "((a + (b * c)) - d)");
    assert_eq!(show(&value("a - b - c")), "((a - b) - c)");
    assert_eq!(show(&value("a < b == c >= d")), "((a < b) == (c >= d))");
    assert_eq!(
        show(&value("a || b && c != d")),
        "(a || (b && (c != d)))"
    );
}

#[test]
fn unary_binds_tighter_than_infix() {
    assert_eq!(show(&value("-a * b")), "(-a * b)");
    assert_eq!(show(&value("!f(x) && y")), "(!f(x) && y)");
    let Expr::Unary { op, .. } = value("!done") else {
        panic!("expected unary");
    };
    assert_eq!(op, UnOp::Not);
}

#[test]
fn calls_bind_tightest_and_chain() {
    assert_eq!(show(&value("f(1) + g(2) * 3")), "(f(Int(1)) + (g(Int(2)) * Int(3)))");
    assert_eq!(show(&value("make()(1)(2)")), "make()(Int(1))(Int(2))");
    assert_eq!(show(&value("f(a + 1, g(b))")), "f((a + Int(1)), g(b))");
}

#[test]
fn oror_is_a_closure_in_prefix_position_and_or_in_infix() {
    assert_eq!(show(&value("|| a || b")), "|| (a || b)");
    let Expr::Binary { op, rhs, .. } = value("a || || b") else {
        panic!("expected binary");
    };
    assert_eq!(op, BinOp::Or);
    assert!(matches!(*rhs, Expr::Closure(_)));
}

#[test]
fn closure_body_extends_to_the_right() {
    assert_eq!(show(&value("|x| x + 1 * 2")), "|x| (x + (Int(1) * Int(2)))");
    assert_eq!(show(&value("|a, b| |c| a + b + c")), "|a, b| |c| ((a + b) + c)");
    // parenthesized closures can be operands
    assert_eq!(show(&value("(|x| x)(1) + 2")), "(|x| x(Int(1)) + Int(2))");
}

#[test]
fn closures_as_arguments() {
    let Expr::Call { args, .. } = value("fold(xs, 0, |acc, x| acc + x)") else {
        panic!("expected call");
    };
    assert_eq!(args.len(), 3);
    assert_eq!(show(&args[2]), "|acc, x| (acc + x)");
}
