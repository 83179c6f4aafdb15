//! Environment synthesis: turn plans into named types with fields, a
//! constructor and, for the singleton, a cache field plus accessor.

use crate::error::LowerError;
use crate::generation::{
    decide, Decision, Degradation, DesiredLayout, EnvState, GenerationBaseline,
    GenerationReport, PriorLayout, Transition, TransitionRecord,
};
use crate::naming::{
    field_names, lambda_name, scope_env_name, static_generic_env_name, SymbolTable,
    EXPANSION_FIELD, INSTANCE_ACCESSOR, INSTANCE_FIELD, PARENT_FIELD, SHARED_STATIC_ENV,
};
use crate::options::LowerOptions;
use crate::plan::{EnvIdentity, EnvPlan, EnvironmentPlan, PlanId, Representation};
use crate::scope::{ClosureId, ScopeTree, VarId};
use crate::types::Ty;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvField {
    pub name: String,
    pub ty: Ty,
    /// Variable stored in the field. `None` for fields kept only for layout
    /// compatibility with an earlier generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var: Option<VarId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentLink {
    pub field: String,
    pub env: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CtorParam {
    pub name: String,
    pub ty: Ty,
}

/// Assigns each parameter to the field of the same name and does nothing
/// else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Constructor {
    pub params: Vec<CtorParam>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingletonAccessor {
    pub cache_field: String,
    pub accessor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvType {
    pub plan: PlanId,
    pub name: String,
    pub identity: EnvIdentity,
    pub kind: Representation,
    pub fields: Vec<EnvField>,
    pub parent: Option<ParentLink>,
    pub constructor: Option<Constructor>,
    pub singleton: Option<SingletonAccessor>,
    pub expansion: Option<EnvField>,
    /// Generation in which `name` was minted.
    pub generation: u32,
}

impl EnvType {
    pub fn field_for(&self, var: VarId) -> Option<&EnvField> {
        self.fields.iter().find(|f| f.var == Some(var))
    }

    pub fn is_reference(&self) -> bool {
        self.kind == Representation::Reference
    }
}

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub generation: u32,
    /// Indexed by plan id.
    pub envs: Vec<EnvType>,
    pub lambda_names: BTreeMap<ClosureId, String>,
    pub report: GenerationReport,
    /// Prior layouts that stay live without being produced this time.
    pub carried: Vec<(String, PriorLayout)>,
    /// Superseded or retired layouts, oldest first: the baseline's history
    /// followed by what this lowering superseded or retired.
    pub history: Vec<(String, PriorLayout)>,
}

impl Synthesis {
    pub fn env(&self, plan: PlanId) -> Result<&EnvType, LowerError> {
        self.envs
            .get(plan.index())
            .ok_or_else(|| LowerError::structural(format!("no environment type for {}", plan)))
    }
}

pub fn synthesize(
    tree: &ScopeTree,
    plan: &EnvironmentPlan,
    options: &LowerOptions,
    baseline: Option<&GenerationBaseline>,
) -> Result<Synthesis, LowerError> {
    let generation = baseline.map(|b| b.generation + 1).unwrap_or(0);
    let mut symbols = SymbolTable::new(&tree.unit);
    for f in &tree.fns {
        symbols.reserve(&f.name);
    }
    for g in &tree.globals {
        symbols.reserve(&g.name);
    }

    let mut lambda_names = BTreeMap::new();
    for c in &tree.closures {
        let name = lambda_name(&tree.function(c.owner)?.name, c.ordinal);
        symbols.declare(&name)?;
        lambda_names.insert(c.id, name);
    }

    let mut report = GenerationReport {
        generation,
        ..Default::default()
    };
    let mut history: Vec<(String, PriorLayout)> =
        baseline.map(|b| b.history.clone()).unwrap_or_default();
    let mut degraded: Vec<(PlanId, Degradation)> = Vec::new();
    let mut envs: Vec<EnvType> = Vec::with_capacity(plan.plans.len());
    let mut counter = 0u32;

    for p in &plan.plans {
        let mut slot_names = Vec::with_capacity(p.slots.len());
        for &v in &p.slots {
            slot_names.push(tree.var(v)?.name.as_str());
        }
        let names = field_names(slot_names);
        let mut desired_fields = Vec::with_capacity(p.slots.len());
        for (name, &v) in names.iter().zip(&p.slots) {
            desired_fields.push((name.clone(), tree.var(v)?.ty.clone()));
        }
        let parent_name = match p.parent {
            Some(pp) => Some(
                envs.get(pp.index())
                    .map(|e| e.name.clone())
                    .ok_or_else(|| {
                        LowerError::structural(format!(
                            "parent {} of {} is synthesized after its child",
                            pp, p.id
                        ))
                    })?,
            ),
            None => None,
        };
        let expansion = options.incremental && p.repr == Representation::Value;
        let identity = p.identity.to_string();
        let prior = baseline.and_then(|b| b.active(&identity));

        let decision = decide(
            prior,
            &DesiredLayout {
                kind: p.repr,
                fields: &desired_fields,
                parent: parent_name.as_deref(),
                singleton: p.singleton,
                expansion,
            },
        );

        let slot_of = |field: &str| -> Option<VarId> {
            names
                .iter()
                .position(|n| n == field)
                .map(|i| p.slots[i])
        };
        let fresh_fields = || -> Vec<EnvField> {
            desired_fields
                .iter()
                .zip(&p.slots)
                .map(|((name, ty), &v)| EnvField {
                    name: name.clone(),
                    ty: ty.clone(),
                    var: Some(v),
                })
                .collect()
        };

        let (name, fields, minted_in) = match decision {
            Decision::Mint => {
                let name = mint(tree, p, &mut counter, generation)?;
                report.transitions.push(TransitionRecord {
                    identity: identity.clone(),
                    transition: Transition::Created { name: name.clone() },
                });
                (name, fresh_fields(), generation)
            }
            Decision::Reuse {
                name,
                prior_fields,
                appended,
                minted_in,
            } => {
                let mut fields: Vec<EnvField> = prior_fields
                    .into_iter()
                    .map(|pf| EnvField {
                        var: slot_of(&pf.name),
                        name: pf.name,
                        ty: pf.ty,
                    })
                    .collect();
                for (fname, ty) in &desired_fields {
                    if appended.contains(fname) {
                        fields.push(EnvField {
                            name: fname.clone(),
                            ty: ty.clone(),
                            var: slot_of(fname),
                        });
                    }
                }
                let transition = if appended.is_empty() {
                    Transition::Unchanged { name: name.clone() }
                } else {
                    Transition::Extended {
                        name: name.clone(),
                        appended,
                    }
                };
                report.transitions.push(TransitionRecord {
                    identity: identity.clone(),
                    transition,
                });
                (name, fields, minted_in)
            }
            Decision::Supersede { previous, reason } => {
                let name = mint(tree, p, &mut counter, generation)?;
                warn!(
                    identity = %identity,
                    previous = %previous,
                    replacement = %name,
                    reason = %reason,
                    "environment layout superseded; degraded to full rebuild"
                );
                if let Some(prior) = prior {
                    let mut old = prior.clone();
                    old.state = EnvState::Superseded;
                    history.push((identity.clone(), old));
                }
                report.transitions.push(TransitionRecord {
                    identity: identity.clone(),
                    transition: Transition::Superseded {
                        previous: previous.clone(),
                        name: name.clone(),
                        reason: reason.clone(),
                    },
                });
                degraded.push((
                    p.id,
                    Degradation {
                        identity: identity.clone(),
                        previous,
                        replacement: name.clone(),
                        reason,
                        dependents: Vec::new(),
                    },
                ));
                (name, fresh_fields(), generation)
            }
        };
        symbols.declare(&name)?;

        let parent = parent_name.map(|env| ParentLink {
            field: PARENT_FIELD.to_string(),
            env,
        });
        let constructor = (p.repr == Representation::Reference).then(|| {
            let mut params: Vec<CtorParam> = fields
                .iter()
                .filter(|f| f.var.is_some())
                .map(|f| CtorParam {
                    name: f.name.clone(),
                    ty: f.ty.clone(),
                })
                .collect();
            if let Some(link) = &parent {
                params.push(CtorParam {
                    name: link.field.clone(),
                    ty: Ty::Env(link.env.clone()),
                });
            }
            Constructor { params }
        });
        let singleton = p.singleton.then(|| SingletonAccessor {
            cache_field: INSTANCE_FIELD.to_string(),
            accessor: INSTANCE_ACCESSOR.to_string(),
        });
        let expansion = expansion.then(|| EnvField {
            name: EXPANSION_FIELD.to_string(),
            ty: Ty::Object,
            var: None,
        });

        debug!(
            env = %name,
            identity = %identity,
            kind = %p.repr,
            fields = fields.len(),
            "environment type synthesized"
        );
        envs.push(EnvType {
            plan: p.id,
            name,
            identity: p.identity.clone(),
            kind: p.repr,
            fields,
            parent,
            constructor,
            singleton,
            expansion,
            generation: minted_in,
        });
    }

    // prior layouts this lowering did not produce
    let mut carried = Vec::new();
    if let Some(b) = baseline {
        let produced: BTreeSet<String> = plan.plans.iter().map(|p| p.identity.to_string()).collect();
        for (identity, layout) in &b.envs {
            if produced.contains(identity) || layout.state != EnvState::Active {
                continue;
            }
            if origin_still_exists(tree, identity) {
                symbols.declare(&layout.name)?;
                report.transitions.push(TransitionRecord {
                    identity: identity.clone(),
                    transition: Transition::Carried {
                        name: layout.name.clone(),
                    },
                });
                carried.push((identity.clone(), layout.clone()));
            } else {
                debug!(identity = %identity, env = %layout.name, "environment retired");
                let mut old = layout.clone();
                old.state = EnvState::Retired;
                report.transitions.push(TransitionRecord {
                    identity: identity.clone(),
                    transition: Transition::Retired {
                        name: layout.name.clone(),
                    },
                });
                history.push((identity.clone(), old));
            }
        }
    }

    for (plan_id, mut d) in degraded {
        d.dependents = dependents_of(tree, plan, &envs, &lambda_names, plan_id);
        report.degraded.push(d);
    }

    Ok(Synthesis {
        generation,
        envs,
        lambda_names,
        report,
        carried,
        history,
    })
}

fn mint(
    tree: &ScopeTree,
    p: &EnvPlan,
    counter: &mut u32,
    generation: u32,
) -> Result<String, LowerError> {
    match &p.identity {
        EnvIdentity::Static => Ok(SHARED_STATIC_ENV.to_string()),
        EnvIdentity::StaticGeneric(_) => {
            let owner = p
                .owner
                .ok_or_else(|| LowerError::structural("generic static environment without owner"))?;
            Ok(static_generic_env_name(tree.function(owner)?.ordinal, generation))
        }
        EnvIdentity::Scope(_) => {
            let origin = p
                .origin
                .ok_or_else(|| LowerError::structural("scope environment without origin"))?;
            let name = scope_env_name(tree.scope(origin)?.ordinal(), *counter, generation);
            *counter += 1;
            Ok(name)
        }
    }
}

fn origin_still_exists(tree: &ScopeTree, identity: &str) -> bool {
    if let Some(key) = identity.strip_prefix("scope:") {
        return tree.find_scope(key).is_some();
    }
    if let Some(func) = identity.strip_prefix("static:") {
        return tree.fns.iter().any(|f| f.name == func);
    }
    identity == "static"
}

/// Environment types chained below `root` and lambdas created with any of
/// them, sorted by name.
fn dependents_of(
    tree: &ScopeTree,
    plan: &EnvironmentPlan,
    envs: &[EnvType],
    lambda_names: &BTreeMap<ClosureId, String>,
    root: PlanId,
) -> Vec<String> {
    let reaches = |start: PlanId| -> bool {
        let mut cur = Some(start);
        let mut steps = 0;
        while let Some(p) = cur {
            if p == root {
                return true;
            }
            steps += 1;
            if steps > plan.plans.len() {
                return false;
            }
            cur = plan.plans.get(p.index()).and_then(|pl| pl.parent);
        }
        false
    };
    let mut out = BTreeSet::new();
    for p in &plan.plans {
        if p.id != root && reaches(p.id) {
            if let Some(env) = envs.get(p.id.index()) {
                out.insert(env.name.clone());
            }
        }
    }
    for c in &tree.closures {
        if let Some(binding) = plan.bindings.get(&c.id) {
            if reaches(binding.plan()) {
                if let Some(name) = lambda_names.get(&c.id) {
                    out.insert(name.clone());
                }
            }
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::bind_module;
    use crate::capture::CaptureAnalysis;
    use crate::plan::plan_environments;
    use capsule_parse::parse_str;

    fn synth_with(src: &str, options: &LowerOptions) -> (ScopeTree, Synthesis) {
        let m = parse_str("<test>", src).expect("parse failed");
        let tree = bind_module(&m, "test").expect("bind failed");
        let analysis = CaptureAnalysis::analyze(&tree).expect("analysis failed");
        let plan = plan_environments(&tree, &analysis, options).expect("planning failed");
        let s = synthesize(&tree, &plan, options, None).expect("synthesis failed");
        (tree, s)
    }

    fn synth(src: &str) -> Synthesis {
        synth_with(src, &LowerOptions::default()).1
    }

    fn field_names_of(env: &EnvType) -> Vec<&str> {
        env.fields.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn value_env_has_no_constructor() {
        let s = synth("fn main() { let x = 1; let f = || x; f() }");
        assert_eq!(s.envs.len(), 1);
        let env = &s.envs[0];
        assert_eq!(env.name, "<>Env0_0");
        assert_eq!(env.kind, Representation::Value);
        assert!(env.constructor.is_none());
        assert_eq!(field_names_of(env), vec!["x"]);
        assert_eq!(env.fields[0].ty, Ty::Int);
    }

    #[test]
    fn reference_env_constructor_takes_slots_and_parent() {
        let s = synth(
            "fn make() { let a = 1; let mut i = 0; let mut keep = || 0; while i < 1 { let b = 2; keep = || a + b; i = i + 1; } keep }",
        );
        let inner = s.envs.iter().find(|e| e.parent.is_some()).expect("inner env");
        let ctor = inner.constructor.as_ref().expect("ctor");
        let params: Vec<_> = ctor.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(params, vec!["b", PARENT_FIELD]);
        assert_eq!(inner.parent.as_ref().map(|p| p.env.as_str()), Some("<>Env0_0"));
    }

    #[test]
    fn names_follow_scope_order_and_counter() {
        let s = synth(
            "fn main() { let a = 1; let f = || a; { let b = 2; let g = || b; g() } f() }",
        );
        let names: Vec<_> = s.envs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["<>Env0_0", "<>Env2_1"]);
    }

    #[test]
    fn singleton_env_has_cache_and_accessor() {
        let s = synth("fn main() { let f = || 1; f() }");
        let env = &s.envs[0];
        assert_eq!(env.name, SHARED_STATIC_ENV);
        let acc = env.singleton.as_ref().expect("singleton accessor");
        assert_eq!(acc.cache_field, INSTANCE_FIELD);
        assert_eq!(acc.accessor, INSTANCE_ACCESSOR);
        assert!(env.fields.is_empty());
        assert!(env.is_reference());
        assert_eq!(env.constructor.as_ref().map(|c| c.params.len()), Some(0));
    }

    #[test]
    fn generic_static_env_is_per_function() {
        let s = synth("fn id<T>(x: T) { let f = |v: T| v; f(x) }");
        assert_eq!(s.envs[0].name, "<>Env0__static");
        assert!(s.envs[0].singleton.is_none());
    }

    #[test]
    fn shadowed_captures_get_distinct_fields() {
        let s = synth("fn main() { let x = 1; let f = || x; let x = 2; let g = || x; f() + g() }");
        assert_eq!(field_names_of(&s.envs[0]), vec!["x", "x$1"]);
    }

    #[test]
    fn incremental_adds_expansion_to_value_envs_only() {
        let opts = LowerOptions::new().incremental(true);
        let (_, s) = synth_with("fn main() { let x = 1; let f = || x; f() }", &opts);
        assert_eq!(
            s.envs[0].expansion.as_ref().map(|f| f.name.as_str()),
            Some(EXPANSION_FIELD)
        );
        let (_, s) = synth_with("fn make() { let x = 1; || x }", &opts);
        assert!(s.envs[0].expansion.is_none());
    }

    #[test]
    fn lambda_names_use_owner_and_ordinal() {
        let s = synth("fn main() { let f = || 1; let g = || 2; f() + g() }");
        let names: Vec<_> = s.lambda_names.values().map(String::as_str).collect();
        assert_eq!(names, vec!["<main>b__0", "<main>b__1"]);
    }

    #[test]
    fn fn_named_like_synthesized_env_collides() {
        let m = parse_str("<test>", "fn main() { let x = 1; let f = || x; f() }").expect("parse");
        let mut tree = bind_module(&m, "test").expect("bind");
        tree.fns[0].name = "<>Env0_0".into();
        let analysis = CaptureAnalysis::analyze(&tree).expect("analysis");
        let plan = plan_environments(&tree, &analysis, &LowerOptions::default()).expect("plan");
        let err = synthesize(&tree, &plan, &LowerOptions::default(), None).unwrap_err();
        assert!(matches!(err, LowerError::NameCollision { .. }));
    }
}
