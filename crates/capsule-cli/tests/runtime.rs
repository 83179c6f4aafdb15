//! Runtime behavior of lowered units: captures observe the same storage as
//! the declaring scope.

use capsule_cli::eval::{run_unit, run_unit_with, Value};
use capsule_cli::singleton::SingletonCache;
use capsule_lower::{bind_module, lower_unit, LowerOptions, LoweredUnit, MergePolicy};
use capsule_parse::parse_str;
use std::sync::Arc;

fn lower_with(src: &str, options: &LowerOptions) -> LoweredUnit {
    let module = parse_str("<test>", src).expect("parse failed");
    let tree = bind_module(&module, "test").expect("bind failed");
    lower_unit(&tree, options, None).expect("lowering failed")
}

fn eval(src: &str) -> i64 {
    eval_with(src, &LowerOptions::default())
}

fn eval_with(src: &str, options: &LowerOptions) -> i64 {
    match run_unit(&lower_with(src, options)).expect("run failed") {
        Value::Int(n) => n,
        other => panic!("expected Int, got {}", other),
    }
}

#[test]
fn write_through_one_closure_is_seen_by_another() {
    let src = r#"
        fn main() {
            let mut x = 0;
            let set = |v| { x = v; };
            let get = || x;
            set(5);
            get()
        }
    "#;
    assert_eq!(eval(src), 5);
}

#[test]
fn closure_writes_are_seen_by_the_declaring_scope() {
    let src = r#"
        fn main() {
            let mut x = 1;
            let bump = || { x = x + 10; };
            bump();
            bump();
            x
        }
    "#;
    assert_eq!(eval(src), 21);
}

#[test]
fn returned_counters_keep_separate_state() {
    let src = r#"
        fn counter() {
            let mut n = 0;
            || { n = n + 1; n }
        }
        fn main() {
            let a = counter();
            let b = counter();
            a();
            a();
            b();
            a() * 10 + b()
        }
    "#;
    assert_eq!(eval(src), 32);
}

#[test]
fn loop_iterations_get_fresh_environments() {
    let src = r#"
        let mut last = || 0;
        fn main() {
            let mut i = 0;
            let mut sum = 0;
            while i < 3 {
                let step = i * 100;
                last = || step;
                sum = sum + last();
                i = i + 1;
            }
            sum + last()
        }
    "#;
    // 0 + 100 + 200, then the closure from the final iteration
    assert_eq!(eval(src), 500);
}

#[test]
fn closure_in_global_shares_its_environment() {
    let src = r#"
        let mut saved = || 0;
        fn stash() {
            let mut x = 1;
            let y = 2;
            saved = || x + y;
            let bump = || { x = x + 100; };
            bump();
            0
        }
        fn main() {
            stash();
            saved()
        }
    "#;
    assert_eq!(eval(src), 103);
}

#[test]
fn nested_closures_reach_outer_variables() {
    let src = r#"
        fn main() {
            let a = 1;
            let f = |b| {
                let g = |c| {
                    let h = || a + b + c;
                    h()
                };
                g(30)
            };
            f(200)
        }
    "#;
    assert_eq!(eval(src), 231);
}

#[test]
fn merged_block_environment_behaves_the_same() {
    let src = r#"
        fn main() {
            let mut a = 1;
            {
                let b = 2;
                let g = || { a = a + b; };
                g();
                g();
            }
            a
        }
    "#;
    let merged = LowerOptions::new().merge(MergePolicy::Contained);
    assert_eq!(eval(src), 5);
    assert_eq!(eval_with(src, &merged), 5);
}

#[test]
fn incremental_layout_runs_unchanged() {
    let src = "fn main() { let a = 4; let f = |x| x * a; f(5) }";
    assert_eq!(eval_with(src, &LowerOptions::new().incremental(true)), 20);
}

#[test]
fn stateless_closures_share_one_singleton() {
    let src = r#"
        fn main() {
            let inc = |v| v + 1;
            let dbl = |v| v * 2;
            let mut i = 0;
            let mut acc = 0;
            while i < 4 {
                let f = |v| v - 1;
                acc = acc + f(dbl(inc(i)));
                i = i + 1;
            }
            acc
        }
    "#;
    let unit = lower_with(src, &LowerOptions::default());
    let cache = Arc::new(SingletonCache::for_unit(&unit));
    let result = run_unit_with(&unit, Arc::clone(&cache)).expect("run failed");
    // (2*1-1) + (2*2-1) + (2*3-1) + (2*4-1)
    assert!(matches!(result, Value::Int(16)), "got {}", result);
    assert_eq!(cache.constructed(), 1);
}

#[test]
fn generic_stateless_closure_runs() {
    let src = r#"
        fn twice<T>(x: T) {
            let id = |v: T| v;
            id(id(x))
        }
        fn main() {
            twice(9)
        }
    "#;
    assert_eq!(eval(src), 9);
}

#[test]
fn closure_forwarded_through_escaping_closure_outlives_block() {
    let src = r#"
        fn make() {
            let x = 1;
            let mut out = || 0;
            {
                let c = || x;
                let a = || {
                    let b = || c();
                    b()
                };
                out = a;
            }
            out
        }
        fn main() {
            let a = make();
            a()
        }
    "#;
    assert_eq!(eval(src), 1);
}
