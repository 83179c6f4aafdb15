//! End-to-end lowering: naming stability, parallel units, rendering

use capsule_lower::lir::{EnvOperand, Expr, Stmt};
use capsule_lower::{bind_module, lower_unit, lower_units, LowerOptions, LoweredUnit, ScopeTree};
use capsule_parse::parse_str;

fn tree(unit: &str, src: &str) -> ScopeTree {
    let module = parse_str("<test>", src).expect("parse failed");
    bind_module(&module, unit).expect("bind failed")
}

fn lower(src: &str) -> LoweredUnit {
    lower_unit(&tree("test", src), &LowerOptions::default(), None).expect("lowering failed")
}

const COUNTER: &str = r#"
    fn counter() {
        let mut n = 0;
        || { n = n + 1; n }
    }
    fn main() {
        let c = counter();
        c();
        c()
    }
"#;

#[test]
fn lowering_twice_gives_identical_output() {
    let a = serde_json::to_string(&lower(COUNTER)).expect("json");
    let b = serde_json::to_string(&lower(COUNTER)).expect("json");
    assert_eq!(a, b);
}

#[test]
fn parallel_units_match_sequential_lowering() {
    let sources = [
        ("alpha", COUNTER),
        ("beta", "fn main() { let a = 1; let f = || a; f() }"),
        ("gamma", "fn main() { let f = |x| x * 2; f(4) }"),
    ];
    let units: Vec<_> = sources
        .iter()
        .map(|(name, src)| (tree(name, src), None))
        .collect();
    let options = LowerOptions::default();
    let parallel = lower_units(&units, &options);
    assert_eq!(parallel.len(), units.len());
    for ((tree, _), result) in units.iter().zip(parallel) {
        let sequential = lower_unit(tree, &options, None).expect("sequential");
        let parallel = result.expect("parallel");
        assert_eq!(
            serde_json::to_string(&sequential).expect("json"),
            serde_json::to_string(&parallel).expect("json")
        );
    }
}

#[test]
fn closure_returned_from_function_uses_heap_environment() {
    let unit = lower(COUNTER);
    let counter = unit.function("counter").expect("counter");
    let Some(tail) = counter.body.tail.as_deref() else {
        panic!("expected tail");
    };
    let Expr::MakeClosure { lambda, env } = tail else {
        panic!("expected closure creation, got {:?}", tail);
    };
    assert_eq!(lambda, "<counter>b__0");
    assert!(matches!(env, EnvOperand::Ref(r) if r.env == "<>Env0_0"));
    assert!(counter
        .body
        .stmts
        .iter()
        .any(|s| matches!(s, Stmt::Store { place, .. } if place.field == "n")));
}

#[test]
fn rendering_lists_environments_and_lambdas() {
    let text = lower(COUNTER).to_string();
    assert!(text.starts_with("unit test generation 0\n"), "{}", text);
    assert!(text.contains("env reference <>Env0_0 [scope:counter]"), "{}", text);
    assert!(text.contains("field n: Int"), "{}", text);
    assert!(text.contains("ctor(n: Int)"), "{}", text);
    assert!(text.contains("enter <>locals0 = new <>Env0_0(uninit);"), "{}", text);
    assert!(text.contains("lambda <counter>b__0(<>env: &<>Env0_0) {"), "{}", text);
    assert!(text.contains("<>env.n = (<>env.n + 1);"), "{}", text);
}

#[test]
fn functions_without_closures_pass_through() {
    let unit = lower("fn add(a, b) { a + b } fn main() { add(1, 2) }");
    assert!(unit.envs.is_empty());
    assert!(unit.lambdas.is_empty());
    assert_eq!(unit.functions.len(), 2);
    let add = unit.function("add").expect("add");
    let params: Vec<_> = add.params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(params, vec!["a", "b"]);
}
