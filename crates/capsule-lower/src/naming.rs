//! Synthesized names and the per-unit symbol table.
//!
//! Every name produced here contains `<` or `$`, which the surface grammar
//! never accepts in identifiers.

use crate::error::LowerError;
use std::collections::{BTreeMap, BTreeSet};

pub const PARENT_FIELD: &str = "<>parent";
pub const INSTANCE_FIELD: &str = "<>instance";
pub const INSTANCE_ACCESSOR: &str = "<>get_instance";
pub const EXPANSION_FIELD: &str = "<>enc$expansion";
pub const SHARED_STATIC_ENV: &str = "<>Env";
/// Parameter through which a lambda receives its environment.
pub const ENV_PARAM: &str = "<>env";

fn generation_suffix(generation: u32) -> String {
    if generation == 0 {
        String::new()
    } else {
        format!("#{}", generation)
    }
}

pub fn scope_env_name(scope_ordinal: u32, counter: u32, generation: u32) -> String {
    format!(
        "<>Env{}_{}{}",
        scope_ordinal,
        counter,
        generation_suffix(generation)
    )
}

pub fn static_generic_env_name(fn_ordinal: u32, generation: u32) -> String {
    format!("<>Env{}__static{}", fn_ordinal, generation_suffix(generation))
}

pub fn lambda_name(fn_name: &str, closure_ordinal: u32) -> String {
    format!("<{}>b__{}", fn_name, closure_ordinal)
}

/// Local slot holding the environment instance of plan `index` in a body.
pub fn env_local_name(index: u32) -> String {
    format!("<>locals{}", index)
}

/// Field names for an environment's slots: the variable name, with `$k`
/// appended to the k-th repeat of a shadowed name.
pub fn field_names<'a>(vars: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen: BTreeMap<&str, u32> = BTreeMap::new();
    vars.into_iter()
        .map(|name| {
            let n = seen.entry(name).or_insert(0);
            let out = if *n == 0 {
                name.to_string()
            } else {
                format!("{}${}", name, n)
            };
            *n += 1;
            out
        })
        .collect()
}

/// Names already taken in one unit. Lowering of independent units uses
/// independent tables.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    unit: String,
    names: BTreeSet<String>,
}

impl SymbolTable {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            names: BTreeSet::new(),
        }
    }

    /// Seed with a symbol the unit already defines.
    pub fn reserve(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }

    pub fn declare(&mut self, name: &str) -> Result<(), LowerError> {
        if !self.names.insert(name.to_string()) {
            return Err(LowerError::NameCollision {
                name: name.to_string(),
                unit: self.unit.clone(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}
