use capsule_ast::ast::{BinOp, Expr, Item, Stmt, TypeExpr};
use capsule_parse::parse_str;

fn parse_expr_only(src: &str) -> Expr {
    let m = parse_str("<mem>", &format!("let x = {src};")).expect("parse ok");
    let Item::Let(ld) = &m.items[0] else {
        panic!("expected Let declaration");
    };
    ld.value.clone()
}

#[test]
fn closure_with_params_and_body() {
    let e = parse_expr_only("|a: Int, b| a + b");
    let Expr::Closure(c) = e else {
        panic!("expected Closure");
    };
    assert_eq!(c.params.len(), 2);
    assert!(c.params[0].ty.is_some());
    assert!(c.params[1].ty.is_none());
    assert!(matches!(*c.body, Expr::Binary { op: BinOp::Add, .. }));
}

#[test]
fn empty_param_closure_uses_oror() {
    let e = parse_expr_only("|| 1");
    let Expr::Closure(c) = e else {
        panic!("expected Closure");
    };
    assert!(c.params.is_empty());
}

#[test]
fn oror_in_infix_position_is_still_or() {
    let e = parse_expr_only("a || b");
    assert!(matches!(e, Expr::Binary { op: BinOp::Or, .. }));
}

#[test]
fn closure_with_block_body() {
    let e = parse_expr_only("|d| { total = total + d; total }");
    let Expr::Closure(c) = e else {
        panic!("expected Closure");
    };
    let Expr::Block(b) = *c.body else {
        panic!("expected Block body");
    };
    assert_eq!(b.stmts.len(), 1);
    assert!(matches!(&b.stmts[0], Stmt::Assign { .. }));
    assert!(b.tail.is_some());
}

#[test]
fn nested_closures() {
    let e = parse_expr_only("|a| |b| a + b");
    let Expr::Closure(outer) = e else {
        panic!("expected Closure");
    };
    assert!(matches!(*outer.body, Expr::Closure(_)));
}

#[test]
fn closure_as_call_argument() {
    let e = parse_expr_only("apply(|v| v * 2, 21)");
    let Expr::Call { args, .. } = e else {
        panic!("expected Call");
    };
    assert_eq!(args.len(), 2);
    assert!(matches!(args[0], Expr::Closure(_)));
}

#[test]
fn immediately_invoked_closure() {
    let e = parse_expr_only("(|v| v)(3)");
    let Expr::Call { callee, .. } = e else {
        panic!("expected Call");
    };
    assert!(matches!(*callee, Expr::Paren { .. }));
}

#[test]
fn fn_type_annotation() {
    let m = parse_str("<mem>", "fn apply(f: fn(Int) -> Int, v: Int) -> Int { f(v) }")
        .expect("parse ok");
    let Item::Fn(fd) = &m.items[0] else {
        panic!("expected Fn");
    };
    let Some(TypeExpr::Arrow { params, .. }) = &fd.params[0].ty else {
        panic!("expected fn type");
    };
    assert_eq!(params.len(), 1);
}

#[test]
fn generic_fn_parameters() {
    let m = parse_str("<mem>", "fn pair<A, B>(a: A, b: B) { a }").expect("parse ok");
    let Item::Fn(fd) = &m.items[0] else {
        panic!("expected Fn");
    };
    let names: Vec<_> = fd.generics.iter().map(|g| g.text.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
}

#[test]
fn while_without_semicolon_followed_by_statements() {
    let m = parse_str(
        "<mem>",
        "fn f() { let mut i = 0; while i < 3 { i = i + 1; } i }",
    )
    .expect("parse ok");
    let Item::Fn(fd) = &m.items[0] else {
        panic!("expected Fn");
    };
    assert_eq!(fd.body.stmts.len(), 2);
    assert!(fd.body.tail.is_some());
}
