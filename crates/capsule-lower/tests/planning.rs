//! Integration tests for environment planning as observed on lowered units

use capsule_lower::lir::{EnvAlloc, Expr, Stmt};
use capsule_lower::{bind_module, lower_unit, LowerOptions, LoweredUnit, MergePolicy, Representation};
use capsule_parse::parse_str;

fn lower_with(src: &str, options: &LowerOptions) -> LoweredUnit {
    let module = parse_str("<test>", src).expect("parse failed");
    let tree = bind_module(&module, "test").expect("bind failed");
    lower_unit(&tree, options, None).expect("lowering failed")
}

fn lower(src: &str) -> LoweredUnit {
    lower_with(src, &LowerOptions::default())
}

fn enter_count(stmts: &[Stmt]) -> usize {
    stmts
        .iter()
        .filter(|s| matches!(s, Stmt::EnterEnv { .. }))
        .count()
}

#[test]
fn local_closures_share_one_value_environment() {
    let src = r#"
        fn main() {
            let mut x = 0;
            let set = |v| { x = v; };
            let get = || x;
            set(5);
            get()
        }
    "#;
    let unit = lower(src);

    assert_eq!(unit.envs.len(), 1);
    let env = &unit.envs[0];
    assert_eq!(env.kind, Representation::Value);
    assert_eq!(env.fields.len(), 1);
    assert_eq!(env.fields[0].name, "x");
    for lambda in &unit.lambdas {
        assert_eq!(lambda.env, env.name);
    }

    let main = unit.function("main").expect("main");
    let Stmt::EnterEnv { kind, .. } = &main.body.stmts[0] else {
        panic!("expected environment entry");
    };
    assert_eq!(*kind, EnvAlloc::StackDecl);
}

#[test]
fn closure_stored_in_global_gets_reference_environment() {
    let src = r#"
        let mut saved = || 0;
        fn stash() {
            let x = 1;
            let y = 2;
            saved = || x + y;
            let other = || x;
            other()
        }
    "#;
    let unit = lower(src);

    let env = unit
        .envs
        .iter()
        .find(|e| e.identity.to_string() == "scope:stash")
        .expect("stash environment");
    assert_eq!(env.kind, Representation::Reference);
    let names: Vec<_> = env.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["x", "y"]);
    assert!(env.constructor.is_some());

    // one allocation per invocation, shared by both closures
    let stash = unit.function("stash").expect("stash");
    assert_eq!(enter_count(&stash.body.stmts), 1);
    assert!(matches!(
        stash.body.stmts[0],
        Stmt::EnterEnv {
            kind: EnvAlloc::Alloc,
            ..
        }
    ));
    let users: Vec<_> = unit
        .lambdas
        .iter()
        .filter(|l| l.env == env.name)
        .map(|l| l.name.as_str())
        .collect();
    assert_eq!(users, vec!["<stash>b__0", "<stash>b__1"]);
}

#[test]
fn local_only_programs_have_no_reference_environments() {
    let src = r#"
        fn main() {
            let a = 1;
            let mut total = 0;
            let add = |v| { total = total + v + a; };
            let mut i = 0;
            while i < 3 {
                let step = i;
                let inc = || add(step);
                inc();
                i = i + 1;
            }
            total
        }
    "#;
    let unit = lower(src);
    assert!(!unit.envs.is_empty());
    assert!(unit.envs.iter().all(|e| e.kind == Representation::Value));
}

#[test]
fn environments_form_a_forest() {
    let src = r#"
        fn main() {
            let a = 1;
            let f = |b| {
                let g = |c| {
                    let h = || a + b + c;
                    h()
                };
                g(3)
            };
            f(2)
        }
    "#;
    let unit = lower(src);
    assert_eq!(unit.envs.len(), 3);
    for env in &unit.envs {
        let mut steps = 0;
        let mut cur = env.parent.as_ref().map(|p| p.env.clone());
        while let Some(name) = cur {
            steps += 1;
            assert!(steps <= unit.envs.len(), "cycle through {}", name);
            cur = unit
                .env(&name)
                .and_then(|e| e.parent.as_ref())
                .map(|p| p.env.clone());
        }
    }
}

#[test]
fn reference_environments_only_chain_to_reference_parents() {
    let src = r#"
        fn keep(f) { f }
        fn main() {
            let a = 1;
            let local = || a;
            local();
            {
                let b = 2;
                keep(|| a + b)
            }
        }
    "#;
    let unit = lower(src);
    for env in unit.envs.iter().filter(|e| e.kind == Representation::Reference) {
        if let Some(link) = &env.parent {
            let parent = unit.env(&link.env).expect("parent env");
            assert_eq!(parent.kind, Representation::Reference, "{} -> {}", env.name, parent.name);
        }
    }
}

#[test]
fn every_free_variable_has_an_access_path() {
    let src = r#"
        fn main() {
            let a = 1;
            let b = 2;
            let f = |x| {
                let g = || a + x;
                g() + b
            };
            f(1)
        }
    "#;
    let unit = lower(src);
    let mut found: Vec<_> = unit
        .captures
        .iter()
        .map(|c| (c.lambda.as_str(), c.name.as_str()))
        .collect();
    found.sort();
    assert_eq!(
        found,
        vec![("<main>b__0", "b"), ("<main>b__1", "a"), ("<main>b__1", "x")]
    );
}

#[test]
fn contained_merge_folds_block_environment() {
    let src = r#"
        fn main() {
            let a = 1;
            {
                let b = 2;
                let g = || a + b;
                g()
            }
        }
    "#;
    let never = lower(src);
    assert_eq!(never.envs.len(), 2);

    let merged = lower_with(src, &LowerOptions::new().merge(MergePolicy::Contained));
    assert_eq!(merged.envs.len(), 1);
    let names: Vec<_> = merged.envs[0].fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);

    // the block no longer enters an environment of its own
    let main = merged.function("main").expect("main");
    assert_eq!(enter_count(&main.body.stmts), 1);
    let Some(Expr::Block(inner)) = main.body.tail.as_deref() else {
        panic!("expected block tail");
    };
    assert_eq!(enter_count(&inner.stmts), 0);
}

#[test]
fn generic_stateless_closures_are_not_cached() {
    let src = r#"
        fn twice<T>(x: T) {
            let id = |v: T| v;
            id(id(x))
        }
        fn main() {
            let inc = |v| v + 1;
            inc(twice(1))
        }
    "#;
    let unit = lower(src);
    let generic = unit.env("<>Env0__static").expect("generic static env");
    assert!(generic.singleton.is_none());
    let shared = unit.env("<>Env").expect("shared singleton");
    assert!(shared.singleton.is_some());
    assert!(shared.fields.is_empty());
}
