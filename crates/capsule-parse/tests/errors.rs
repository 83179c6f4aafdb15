use capsule_parse::{parse_str, MAX_NESTING_DEPTH};

fn parse_err(src: &str) -> String {
    parse_str("unit.cap", src).unwrap_err().to_string()
}

#[test]
fn errors_name_file_and_offset() {
    let err = parse_err("fn main() { 1 }\nlet a = 1");
    assert!(err.starts_with("unit.cap:25:"), "got: {err}");
    assert!(err.contains("expected Semicolon"), "got: {err}");
}

#[test]
fn only_fn_and_let_at_top_level() {
    let err = parse_err("|| 1;");
    assert!(err.contains("unexpected token at top level"), "got: {err}");
}

#[test]
fn unclosed_closure_params() {
    let err = parse_err("let f = |a, b a;");
    assert!(err.contains("expected Pipe"), "got: {err}");
}

#[test]
fn closure_needs_a_body() {
    let err = parse_err("let f = |a|;");
    assert!(err.contains("unexpected token in expression"), "got: {err}");
}

#[test]
fn unclosed_type_params() {
    let err = parse_err("fn id<T(x: T) { x }");
    assert!(err.contains("expected Gt"), "got: {err}");
}

#[test]
fn assignment_to_call_is_rejected() {
    let err = parse_err("fn f() { make()() = 1; }");
    assert!(err.contains("assignment target must be a variable"), "got: {err}");
}

#[test]
fn expression_statements_need_a_separator() {
    let err = parse_err("fn f() { let g = || 1; g() g() }");
    assert!(err.contains("expected ';', '=', or '}'"), "got: {err}");
}

#[test]
fn lex_errors_surface() {
    let err = parse_err("let a = 1 @ 2;");
    assert!(err.contains("unexpected character '@'"), "got: {err}");
    let err = parse_err("let s = \"open;");
    assert!(err.contains("unterminated string literal"), "got: {err}");
}

#[test]
fn deeply_nested_closures_hit_the_limit() {
    let depth = MAX_NESTING_DEPTH as usize + 10;
    let src = format!("let f = {}0;", "|| ".repeat(depth));
    let err = parse_err(&src);
    assert!(err.contains("nesting depth limit"), "got: {err}");
}
