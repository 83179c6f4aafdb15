//! Lazy-once instances for singleton environments.
//!
//! Every stateless closure of a unit shares one slot-less environment. The
//! first closure creation constructs it; concurrent first uses observe the
//! same instance, and later reads never take a lock.

use crate::eval::{EnvCell, EnvObject};
use capsule_lower::LoweredUnit;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Default)]
pub struct SingletonCache {
    cells: HashMap<String, OnceCell<EnvCell>>,
    constructed: AtomicUsize,
}

impl SingletonCache {
    /// One empty slot per environment that declares a singleton accessor.
    pub fn for_unit(unit: &LoweredUnit) -> Self {
        let cells = unit
            .envs
            .iter()
            .filter(|e| e.singleton.is_some())
            .map(|e| (e.name.clone(), OnceCell::new()))
            .collect();
        Self {
            cells,
            constructed: AtomicUsize::new(0),
        }
    }

    /// The shared instance of `env`, constructing it on first use. `None` if
    /// `env` has no singleton accessor.
    pub fn instance(&self, env: &str) -> Option<EnvCell> {
        let cell = self.cells.get(env)?;
        let instance = cell.get_or_init(|| {
            self.constructed.fetch_add(1, Ordering::SeqCst);
            debug!(env = %env, "singleton environment constructed");
            Arc::new(Mutex::new(EnvObject::new(env)))
        });
        Some(Arc::clone(instance))
    }

    pub fn is_initialized(&self, env: &str) -> bool {
        self.cells.get(env).is_some_and(|c| c.get().is_some())
    }

    /// Number of instances constructed so far.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_lower::{bind_module, lower_unit, LowerOptions};
    use capsule_parse::parse_str;

    fn unit(src: &str) -> LoweredUnit {
        let module = parse_str("<test>", src).expect("parse failed");
        let tree = bind_module(&module, "test").expect("bind failed");
        lower_unit(&tree, &LowerOptions::default(), None).expect("lowering failed")
    }

    #[test]
    fn instance_is_built_once() {
        let u = unit("fn main() { let f = |x| x + 1; let g = |x| x * 2; f(g(2)) }");
        let cache = SingletonCache::for_unit(&u);
        assert!(!cache.is_initialized("<>Env"));
        let a = cache.instance("<>Env").expect("singleton");
        let b = cache.instance("<>Env").expect("singleton");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.constructed(), 1);
        assert!(cache.is_initialized("<>Env"));
    }

    #[test]
    fn non_singleton_env_has_no_instance() {
        let u = unit("fn main() { let a = 1; let f = || a; f() }");
        let cache = SingletonCache::for_unit(&u);
        assert!(cache.instance("<>Env0_0").is_none());
        assert_eq!(cache.constructed(), 0);
    }
}
