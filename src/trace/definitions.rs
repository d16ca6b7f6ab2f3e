//! Global trace definitions. Cross references are typed `Ref`s into the
//! registry, never owning pointers.

use serde::Serialize;

use super::registry::Ref;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StringDef {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemTreeDomain {
    SharedMemory,
    Socket,
    Core,
    Pu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemTreeNode {
    pub name: Ref<StringDef>,
    pub class: Ref<StringDef>,
    pub parent: Option<Ref<SystemTreeNode>>,
    pub domains: Vec<SystemTreeDomain>,
    pub properties: Vec<(Ref<StringDef>, Ref<StringDef>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationGroupType {
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationGroup {
    pub name: Ref<StringDef>,
    #[serde(rename = "type")]
    pub group_type: LocationGroupType,
    pub parent: Ref<SystemTreeNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    CpuThread,
    Metric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationDef {
    pub name: Ref<StringDef>,
    #[serde(rename = "type")]
    pub location_type: LocationType,
    pub group: Ref<LocationGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionRole {
    Function,
    Artificial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Paradigm {
    Sampling,
    User,
    Pthread,
    Measurement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub name: Ref<StringDef>,
    pub canonical_name: Ref<StringDef>,
    pub description: Ref<StringDef>,
    pub role: RegionRole,
    pub paradigm: Paradigm,
    pub source_file: Ref<StringDef>,
    pub begin_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionsGroup {
    pub name: Ref<StringDef>,
    pub paradigm: Paradigm,
    pub members: Vec<Ref<Region>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCodeLocation {
    pub file: Ref<StringDef>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallingContext {
    pub region: Ref<Region>,
    pub source_code_location: Option<Ref<SourceCodeLocation>>,
    pub parent: Option<Ref<CallingContext>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallingContextProperty {
    pub calling_context: Ref<CallingContext>,
    pub name: Ref<StringDef>,
    pub value: Ref<StringDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommGroup {
    pub name: Ref<StringDef>,
    pub paradigm: Paradigm,
    pub members: Vec<Ref<LocationDef>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comm {
    pub name: Ref<StringDef>,
    pub group: Ref<CommGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMode {
    AccumulatedStart,
    AbsolutePoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValueType {
    Double,
    Uint64,
    Int64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricMember {
    pub name: Ref<StringDef>,
    pub description: Ref<StringDef>,
    pub mode: MetricMode,
    pub value_type: MetricValueType,
    pub unit: Ref<StringDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricClass {
    pub members: Vec<Ref<MetricMember>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "ref")]
pub enum MetricScope {
    Location(Ref<LocationDef>),
    SystemTreeNode(Ref<SystemTreeNode>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricInstance {
    pub class: Ref<MetricClass>,
    pub recorder: Ref<LocationDef>,
    pub scope: MetricScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterruptGenerator {
    pub name: Ref<StringDef>,
    pub mode: &'static str,
    pub period: u64,
}
