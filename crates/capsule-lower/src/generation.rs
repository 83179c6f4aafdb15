//! Generation compatibility.
//!
//! A [`GenerationBaseline`] records the environment layouts emitted by a
//! previous lowering of the same unit, keyed by environment identity. When a
//! new lowering finds a compatible prior layout it keeps the old name and
//! field order and only appends; otherwise the environment is superseded and
//! a [`Degradation`] tells the caller that it and its dependents were rebuilt.

use crate::plan::Representation;
use crate::synth::EnvType;
use crate::types::Ty;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvState {
    Active,
    Superseded,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorField {
    pub name: String,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorLayout {
    pub name: String,
    pub kind: Representation,
    pub fields: Vec<PriorField>,
    /// Name of the parent environment type, if linked.
    pub parent: Option<String>,
    pub singleton: bool,
    pub expansion: bool,
    /// Generation in which this layout's name was minted.
    pub minted_in: u32,
    pub state: EnvState,
    pub digest: String,
}

impl PriorLayout {
    pub fn from_env(env: &EnvType) -> Self {
        PriorLayout {
            name: env.name.clone(),
            kind: env.kind,
            fields: env
                .fields
                .iter()
                .map(|f| PriorField {
                    name: f.name.clone(),
                    ty: f.ty.clone(),
                })
                .collect(),
            parent: env.parent.as_ref().map(|p| p.env.clone()),
            singleton: env.singleton.is_some(),
            expansion: env.expansion.is_some(),
            minted_in: env.generation,
            state: EnvState::Active,
            digest: layout_digest(env),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationBaseline {
    pub unit: String,
    pub generation: u32,
    /// Live layouts by identity (`scope:main/0`, `static`, `static:f`).
    pub envs: BTreeMap<String, PriorLayout>,
    /// Layouts that were superseded or retired, oldest first.
    #[serde(default)]
    pub history: Vec<(String, PriorLayout)>,
}

impl GenerationBaseline {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn active(&self, identity: &str) -> Option<&PriorLayout> {
        self.envs
            .get(identity)
            .filter(|l| l.state == EnvState::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Created {
        name: String,
    },
    Unchanged {
        name: String,
    },
    Extended {
        name: String,
        appended: Vec<String>,
    },
    Superseded {
        previous: String,
        name: String,
        reason: String,
    },
    /// Not produced by this lowering but its scope still exists.
    Carried {
        name: String,
    },
    Retired {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub identity: String,
    pub transition: Transition,
}

/// "Degraded to full rebuild" signal for one superseded environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Degradation {
    pub identity: String,
    pub previous: String,
    pub replacement: String,
    pub reason: String,
    /// Environment types and lambdas that have to be regenerated with it.
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub generation: u32,
    pub transitions: Vec<TransitionRecord>,
    pub degraded: Vec<Degradation>,
}

impl GenerationReport {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Shape a new lowering wants for one environment, before names are fixed.
pub(crate) struct DesiredLayout<'a> {
    pub kind: Representation,
    pub fields: &'a [(String, Ty)],
    pub parent: Option<&'a str>,
    pub singleton: bool,
    pub expansion: bool,
}

pub(crate) enum Decision {
    /// No usable prior layout.
    Mint,
    /// Keep the prior name; prior fields first, then `appended`.
    Reuse {
        name: String,
        prior_fields: Vec<PriorField>,
        appended: Vec<String>,
        minted_in: u32,
    },
    /// Prior layout exists but cannot be extended.
    Supersede { previous: String, reason: String },
}

pub(crate) fn decide(prior: Option<&PriorLayout>, desired: &DesiredLayout<'_>) -> Decision {
    let Some(prior) = prior else {
        return Decision::Mint;
    };
    let supersede = |reason: String| Decision::Supersede {
        previous: prior.name.clone(),
        reason,
    };
    if prior.kind != desired.kind {
        return supersede(format!(
            "representation changed from {} to {}",
            prior.kind, desired.kind
        ));
    }
    if prior.singleton != desired.singleton {
        return supersede("singleton-ness changed".to_string());
    }
    if prior.expansion != desired.expansion {
        return supersede("expansion field toggled".to_string());
    }
    match (prior.parent.as_deref(), desired.parent) {
        (None, None) => {}
        (Some(a), Some(b)) if a == b => {}
        (None, Some(_)) => return supersede("parent link added".to_string()),
        (Some(_), None) => return supersede("parent link removed".to_string()),
        (Some(a), Some(b)) => {
            return supersede(format!("parent environment changed from {} to {}", a, b))
        }
    }
    let mut appended = Vec::new();
    for (name, ty) in desired.fields {
        match prior.fields.iter().find(|f| &f.name == name) {
            Some(f) if &f.ty != ty => {
                return supersede(format!(
                    "field {} changed type from {} to {}",
                    name, f.ty, ty
                ))
            }
            Some(_) => {}
            None => appended.push(name.clone()),
        }
    }
    Decision::Reuse {
        name: prior.name.clone(),
        prior_fields: prior.fields.clone(),
        appended,
        minted_in: prior.minted_in,
    }
}

/// SHA-256 over the observable shape of an environment type.
pub fn layout_digest(env: &EnvType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(env.name.as_bytes());
    hasher.update([0]);
    hasher.update(env.kind.to_string().as_bytes());
    for f in &env.fields {
        hasher.update([0]);
        hasher.update(f.name.as_bytes());
        hasher.update(b":");
        hasher.update(f.ty.to_string().as_bytes());
    }
    if let Some(p) = &env.parent {
        hasher.update(b"\0parent:");
        hasher.update(p.env.as_bytes());
    }
    if env.singleton.is_some() {
        hasher.update(b"\0singleton");
    }
    if env.expansion.is_some() {
        hasher.update(b"\0expansion");
    }
    format!("sha256:{:x}", hasher.finalize())
}
