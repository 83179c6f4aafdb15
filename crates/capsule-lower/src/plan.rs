//! Environment planning: decide which scopes get an environment, what lives
//! in it, how environments chain to their parents, and whether each one is a
//! value (owned by the scope's frame) or a reference (shared, heap-owned).

use crate::capture::CaptureAnalysis;
use crate::error::LowerError;
use crate::options::{LowerOptions, MergePolicy};
use crate::scope::{
    ClosureId, ClosureInfo, FnId, ScopeId, ScopeKey, ScopeKind, ScopeTree, VarId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PlanId(pub u32);

impl PlanId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Representation {
    Value,
    Reference,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Representation::Value => write!(f, "value"),
            Representation::Reference => write!(f, "reference"),
        }
    }
}

/// What an environment stands for across generations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EnvIdentity {
    Scope(ScopeKey),
    /// The unit-wide singleton shared by stateless closures.
    Static,
    /// Stateless environment of one generic function.
    StaticGeneric(String),
}

impl fmt::Display for EnvIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvIdentity::Scope(key) => write!(f, "scope:{}", key),
            EnvIdentity::Static => write!(f, "static"),
            EnvIdentity::StaticGeneric(func) => write!(f, "static:{}", func),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvPlan {
    pub id: PlanId,
    pub identity: EnvIdentity,
    /// Scope whose entry allocates the environment. `None` for static plans.
    pub origin: Option<ScopeId>,
    /// Nested scopes folded into this plan.
    pub merged: Vec<ScopeId>,
    pub owner: Option<FnId>,
    pub repr: Representation,
    /// Captured variables, in declaration order.
    pub slots: Vec<VarId>,
    pub parent: Option<PlanId>,
    pub singleton: bool,
}

/// How a closure obtains the environment it is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClosureBinding {
    /// The innermost environment holding something the closure needs.
    Direct(PlanId),
    /// The shared, lazily built singleton.
    Singleton(PlanId),
    /// A fresh slot-less instance per creation (generic stateless closures).
    Fresh(PlanId),
}

impl ClosureBinding {
    pub fn plan(self) -> PlanId {
        match self {
            ClosureBinding::Direct(p) | ClosureBinding::Singleton(p) | ClosureBinding::Fresh(p) => p,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentPlan {
    pub plans: Vec<EnvPlan>,
    pub scope_plan: BTreeMap<ScopeId, PlanId>,
    pub var_plan: BTreeMap<VarId, PlanId>,
    pub bindings: BTreeMap<ClosureId, ClosureBinding>,
    /// Environments each closure must be able to reach from its own.
    pub needed: BTreeMap<ClosureId, BTreeSet<PlanId>>,
}

impl EnvironmentPlan {
    pub fn plan(&self, id: PlanId) -> Result<&EnvPlan, LowerError> {
        self.plans
            .get(id.index())
            .ok_or_else(|| LowerError::structural(format!("unknown environment plan {}", id)))
    }

    /// Parent hops leading from `from` to `to`, each entry being the plan
    /// reached by that hop. Empty when `from == to`.
    pub fn hops(&self, from: PlanId, to: PlanId) -> Result<Vec<PlanId>, LowerError> {
        let mut out = Vec::new();
        let mut cur = from;
        while cur != to {
            cur = self.plan(cur)?.parent.ok_or_else(|| {
                LowerError::structural(format!("environment {} is not reachable from {}", to, from))
            })?;
            out.push(cur);
            if out.len() > self.plans.len() {
                return Err(LowerError::structural("cyclic environment chain"));
            }
        }
        Ok(out)
    }

    pub fn for_scope(&self, scope: ScopeId) -> Option<&EnvPlan> {
        self.scope_plan.get(&scope).and_then(|p| self.plans.get(p.index()))
    }

    /// Every parent chain ends, i.e. the plans form a forest.
    pub fn check_forest(&self) -> Result<(), LowerError> {
        for p in &self.plans {
            let mut seen = 0;
            let mut cur = p.parent;
            while let Some(id) = cur {
                seen += 1;
                if seen > self.plans.len() {
                    return Err(LowerError::structural(format!(
                        "environment chain starting at {} is cyclic",
                        p.id
                    )));
                }
                cur = self.plan(id)?.parent;
            }
        }
        Ok(())
    }
}

struct Candidate {
    slots: Vec<VarId>,
    merged: Vec<ScopeId>,
    repr: Representation,
}

pub fn plan_environments(
    tree: &ScopeTree,
    analysis: &CaptureAnalysis,
    options: &LowerOptions,
) -> Result<EnvironmentPlan, LowerError> {
    // -----------------------------------------------------------------------
    // one candidate per scope declaring captured variables
    // -----------------------------------------------------------------------
    let mut candidates: BTreeMap<ScopeId, Candidate> = BTreeMap::new();
    for (&v, cv) in &analysis.captured {
        let scope = tree.var(v)?.scope;
        let cand = candidates.entry(scope).or_insert_with(|| Candidate {
            slots: Vec::new(),
            merged: Vec::new(),
            repr: Representation::Value,
        });
        cand.slots.push(v);
        if cv.escapes {
            cand.repr = Representation::Reference;
        }
    }

    if options.merge == MergePolicy::Contained {
        merge_contained(tree, analysis, &mut candidates)?;
    }

    // -----------------------------------------------------------------------
    // materialize plans in declaration order of their originating scopes
    // -----------------------------------------------------------------------
    let mut out = EnvironmentPlan::default();
    for (scope, cand) in candidates {
        let id = PlanId(out.plans.len() as u32);
        let s = tree.scope(scope)?;
        out.scope_plan.insert(scope, id);
        for &m in &cand.merged {
            out.scope_plan.insert(m, id);
        }
        for &v in &cand.slots {
            out.var_plan.insert(v, id);
        }
        out.plans.push(EnvPlan {
            id,
            identity: EnvIdentity::Scope(s.key.clone()),
            origin: Some(scope),
            merged: cand.merged,
            owner: Some(s.owner),
            repr: cand.repr,
            slots: cand.slots,
            parent: None,
            singleton: false,
        });
    }

    for c in &tree.closures {
        let mut set = BTreeSet::new();
        if let Some(vars) = analysis.needs.get(&c.id) {
            for v in vars {
                let p = out.var_plan.get(v).ok_or_else(|| {
                    LowerError::structural(format!("captured variable {} has no environment", v))
                })?;
                set.insert(*p);
            }
        }
        out.needed.insert(c.id, set);
    }

    link_parents(tree, &mut out)?;
    assign_representations(tree, &mut out)?;
    bind_stateless(tree, &mut out)?;
    out.check_forest()?;

    for p in &out.plans {
        debug!(
            plan = %p.id,
            identity = %p.identity,
            repr = %p.repr,
            slots = p.slots.len(),
            parent = ?p.parent,
            "environment planned"
        );
    }
    Ok(out)
}

fn origin_depth(
    tree: &ScopeTree,
    plans: &EnvironmentPlan,
    p: PlanId,
) -> Result<(u32, u32), LowerError> {
    match plans.plan(p)?.origin {
        Some(s) => Ok((tree.scope(s)?.depth, s.0)),
        None => Ok((0, 0)),
    }
}

/// Nearest plan whose scope strictly encloses `p`'s origin.
fn nearest_enclosing(
    tree: &ScopeTree,
    plans: &EnvironmentPlan,
    p: PlanId,
) -> Result<Option<PlanId>, LowerError> {
    let Some(origin) = plans.plan(p)?.origin else {
        return Ok(None);
    };
    let mut cur = tree.scope(origin)?.parent;
    while let Some(s) = cur {
        if let Some(&found) = plans.scope_plan.get(&s) {
            if found != p {
                return Ok(Some(found));
            }
        }
        cur = tree.scope(s)?.parent;
    }
    Ok(None)
}

fn merge_contained(
    tree: &ScopeTree,
    analysis: &CaptureAnalysis,
    candidates: &mut BTreeMap<ScopeId, Candidate>,
) -> Result<(), LowerError> {
    let mut keyed = Vec::with_capacity(candidates.len());
    for &s in candidates.keys() {
        keyed.push((tree.scope(s)?.depth, s));
    }
    keyed.sort_by(|a, b| b.cmp(a));

    let users_of = |cand: &Candidate| -> BTreeSet<ClosureId> {
        cand.slots
            .iter()
            .flat_map(|v| analysis.users(*v))
            .collect()
    };

    for (_, s) in keyed {
        let scope = tree.scope(s)?;
        // loop bodies get a fresh environment per iteration
        if scope.kind != ScopeKind::Block {
            continue;
        }
        let mut target = None;
        let mut cur = scope.parent;
        while let Some(p) = cur {
            if candidates.contains_key(&p) {
                target = Some(p);
                break;
            }
            let ps = tree.scope(p)?;
            if ps.kind != ScopeKind::Block {
                break;
            }
            cur = ps.parent;
        }
        let Some(t) = target else {
            continue;
        };
        let (Some(inner), Some(outer)) = (candidates.get(&s), candidates.get(&t)) else {
            continue;
        };
        if inner.repr != outer.repr || !users_of(inner).is_subset(&users_of(outer)) {
            continue;
        }
        if let Some(inner) = candidates.remove(&s) {
            if let Some(outer) = candidates.get_mut(&t) {
                debug!(inner = %s, outer = %t, "merging environment into enclosing scope");
                outer.slots.extend(inner.slots);
                outer.slots.sort();
                outer.merged.push(s);
                outer.merged.extend(inner.merged);
            }
        }
    }
    Ok(())
}

/// Link each needed environment to its parent and make every environment
/// available wherever something created there needs it. Runs to a fixpoint
/// because linking a parent can oblige intermediate closures to carry it.
fn link_parents(tree: &ScopeTree, out: &mut EnvironmentPlan) -> Result<(), LowerError> {
    loop {
        let mut changed = false;

        for c in &tree.closures {
            let needed = needed_of(out, c.id);
            let Some(direct) = innermost(tree, out, &needed)? else {
                continue;
            };
            let mut remaining: BTreeSet<PlanId> = needed.into_iter().collect();
            remaining.remove(&direct);
            let mut cur = direct;
            while !remaining.is_empty() {
                let p = nearest_enclosing(tree, out, cur)?.ok_or_else(|| {
                    LowerError::structural(format!(
                        "closure {} needs an environment that does not enclose {}",
                        c.id, cur
                    ))
                })?;
                if out.plans[cur.index()].parent != Some(p) {
                    out.plans[cur.index()].parent = Some(p);
                    changed = true;
                }
                remaining.remove(&p);
                cur = p;
            }
        }

        // a parent allocated outside a closure body has to be carried in
        let mut additions: Vec<(ClosureId, PlanId)> = Vec::new();
        for p in &out.plans {
            let (Some(origin), Some(parent)) = (p.origin, p.parent) else {
                continue;
            };
            let Some(porigin) = out.plans[parent.index()].origin else {
                continue;
            };
            for cb in tree.closures_between(origin, porigin)? {
                additions.push((cb, parent));
            }
        }
        for c in &tree.closures {
            for p in needed_of(out, c.id) {
                let Some(porigin) = out.plans[p.index()].origin else {
                    continue;
                };
                for cb in tree.closures_between(c.declared_in, porigin)? {
                    additions.push((cb, p));
                }
            }
        }
        for (cb, p) in additions {
            if out.needed.entry(cb).or_default().insert(p) {
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    for c in &tree.closures {
        let needed = needed_of(out, c.id);
        if let Some(direct) = innermost(tree, out, &needed)? {
            out.bindings.insert(c.id, ClosureBinding::Direct(direct));
        }
    }
    Ok(())
}

fn needed_of(out: &EnvironmentPlan, c: ClosureId) -> Vec<PlanId> {
    out.needed
        .get(&c)
        .map(|s| s.iter().copied().collect())
        .unwrap_or_default()
}

fn innermost(
    tree: &ScopeTree,
    out: &EnvironmentPlan,
    plans: &[PlanId],
) -> Result<Option<PlanId>, LowerError> {
    let mut best: Option<((u32, u32), PlanId)> = None;
    for &p in plans {
        let key = origin_depth(tree, out, p)?;
        if best.map(|(k, _)| key > k).unwrap_or(true) {
            best = Some((key, p));
        }
    }
    Ok(best.map(|(_, p)| p))
}

fn assign_representations(tree: &ScopeTree, out: &mut EnvironmentPlan) -> Result<(), LowerError> {
    for c in tree.closures.iter().filter(|c| c.escapes) {
        let Some(ClosureBinding::Direct(direct)) = out.bindings.get(&c.id).copied() else {
            continue;
        };
        let mut cur = Some(direct);
        while let Some(p) = cur {
            out.plans[p.index()].repr = Representation::Reference;
            cur = out.plans[p.index()].parent;
        }
    }
    // a reference environment may only point at reference environments
    loop {
        let mut changed = false;
        for i in 0..out.plans.len() {
            if out.plans[i].repr != Representation::Reference {
                continue;
            }
            if let Some(parent) = out.plans[i].parent {
                if out.plans[parent.index()].repr != Representation::Reference {
                    out.plans[parent.index()].repr = Representation::Reference;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    Ok(())
}

/// True if a parameter or local of the closure, or of anything nested in it,
/// is typed with one of the enclosing function's type parameters.
fn uses_type_param(tree: &ScopeTree, c: &ClosureInfo) -> bool {
    tree.vars.iter().any(|v| {
        (v.scope == c.scope || tree.is_strict_ancestor(c.scope, v.scope)) && v.ty.is_generic()
    })
}

/// Binds closures without captures. Those that use a type parameter of a
/// generic function get a fresh per-function instance; every other one
/// shares the unit's singleton.
fn bind_stateless(tree: &ScopeTree, out: &mut EnvironmentPlan) -> Result<(), LowerError> {
    let mut generic: BTreeMap<FnId, Vec<ClosureId>> = BTreeMap::new();
    let mut shared: Vec<ClosureId> = Vec::new();
    for c in &tree.closures {
        if out.bindings.contains_key(&c.id) {
            continue;
        }
        if tree.function(c.owner)?.is_generic() && uses_type_param(tree, c) {
            generic.entry(c.owner).or_default().push(c.id);
        } else {
            shared.push(c.id);
        }
    }

    for (f, closures) in generic {
        let id = PlanId(out.plans.len() as u32);
        out.plans.push(EnvPlan {
            id,
            identity: EnvIdentity::StaticGeneric(tree.function(f)?.name.clone()),
            origin: None,
            merged: Vec::new(),
            owner: Some(f),
            repr: Representation::Reference,
            slots: Vec::new(),
            parent: None,
            singleton: false,
        });
        for c in closures {
            out.bindings.insert(c, ClosureBinding::Fresh(id));
        }
    }

    if !shared.is_empty() {
        let id = PlanId(out.plans.len() as u32);
        out.plans.push(EnvPlan {
            id,
            identity: EnvIdentity::Static,
            origin: None,
            merged: Vec::new(),
            owner: None,
            repr: Representation::Reference,
            slots: Vec::new(),
            parent: None,
            singleton: true,
        });
        for c in shared {
            out.bindings.insert(c, ClosureBinding::Singleton(id));
        }
    }
    Ok(())
}
