//! VirtualMachineClass CRD
//!
//! Cluster-scoped sizing and placement policy a machine references by
//! name. The VM controller checks readiness and reads CPU model and
//! node placement from here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualMachineClass",
    status = "VmClassStatus",
    shortname = "vmclass"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClassSpec {
    /// Guest CPU model policy.
    #[serde(default)]
    pub cpu: ClassCpuSpec,

    /// Node selector restricting where machines of this class run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<ClassNodeSelector>,
}

/// CPU model policy of a class.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClassCpuSpec {
    /// Model selection strategy.
    #[serde(rename = "type", default)]
    pub type_: CpuModelType,

    /// Concrete model name, for the Model strategy.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,

    /// Required CPU features, for the Features strategy.
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum CpuModelType {
    /// Pass the host CPU through.
    Host,

    /// Lowest common model across nodes.
    #[default]
    Discovery,

    /// A specific named model.
    Model,

    /// Any model with the listed features.
    Features,
}

/// Node placement of a class.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClassNodeSelector {
    #[serde(default)]
    pub match_labels: std::collections::BTreeMap<String, String>,
}

/// Phase of a class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VmClassPhase {
    #[default]
    Pending,
    Ready,
    Terminating,
}

/// Observed state of a class.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmClassStatus {
    #[serde(default)]
    pub phase: VmClassPhase,

    #[serde(default)]
    pub conditions: ConditionSet,

    /// Nodes currently matching the class placement.
    #[serde(default)]
    pub available_nodes: Vec<String>,

    #[serde(default)]
    pub observed_generation: i64,
}
