//! Store-once registry of trace definitions.
//!
//! Every definition kind lives in its own arena. A definition is addressed by
//! a typed [`Ref`] (its index in the arena) and may additionally be bound to a
//! [`Key`]. At most one definition exists per key and kind.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::marker::PhantomData;

use serde::{Serialize, Serializer};

use super::definitions::*;
use crate::error::{Error, Result};
use crate::location::Location;
use crate::mmap::LineInfo;

/// Index of a definition of kind `T`.
pub struct Ref<T> {
    id: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Ref<T> {
    fn new(id: u32) -> Self {
        Ref {
            id,
            _kind: PhantomData,
        }
    }

    /// Handle for an id read back from a mapping table or a file.
    pub fn from_id(id: u32) -> Self {
        Self::new(id)
    }

    pub fn id(self) -> u32 {
        self.id
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ref<T> {}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Ref<T> {}

impl<T> PartialOrd for Ref<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ref<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self.id)
    }
}

impl<T> Serialize for Ref<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    ByString(String),
    ByThread(libc::pid_t),
    ByProcess(libc::pid_t),
    ByPackage(u32),
    ByCore { core: u32, package: u32 },
    ByCpu(u32),
    ByLocation(Location),
    ByLineInfo(LineInfo),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::ByString(s) => write!(f, "string {s:?}"),
            Key::ByThread(tid) => write!(f, "thread {tid}"),
            Key::ByProcess(pid) => write!(f, "process {pid}"),
            Key::ByPackage(package) => write!(f, "package {package}"),
            Key::ByCore { core, package } => write!(f, "core {package}:{core}"),
            Key::ByCpu(cpu) => write!(f, "cpu {cpu}"),
            Key::ByLocation(location) => write!(f, "{location}"),
            Key::ByLineInfo(line_info) => write!(f, "{line_info}"),
        }
    }
}

/// Arena of one definition kind plus its key index.
#[derive(Debug)]
pub struct Store<T> {
    items: Vec<T>,
    keys: HashMap<Key, Ref<T>>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Store {
            items: Vec::new(),
            keys: HashMap::new(),
        }
    }
}

impl<T> Store<T> {
    fn push(&mut self, value: T) -> Ref<T> {
        let r = Ref::new(self.items.len() as u32);
        self.items.push(value);
        r
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ref<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(id, item)| (Ref::new(id as u32), item))
    }
}

/// A definition kind held by the [`Registry`].
pub trait Definition: Serialize + Sized {
    const KIND: &'static str;

    fn store(registry: &Registry) -> &Store<Self>;
    fn store_mut(registry: &mut Registry) -> &mut Store<Self>;
}

macro_rules! registry {
    ($($field:ident: $ty:ty => $kind:literal),* $(,)?) => {
        #[derive(Debug, Default)]
        pub struct Registry {
            $($field: Store<$ty>,)*
        }

        $(
            impl Definition for $ty {
                const KIND: &'static str = $kind;

                fn store(registry: &Registry) -> &Store<Self> {
                    &registry.$field
                }

                fn store_mut(registry: &mut Registry) -> &mut Store<Self> {
                    &mut registry.$field
                }
            }
        )*

        impl Registry {
            /// Writes one JSON line per definition, kind by kind.
            pub fn write_definitions<W: Write>(&self, mut out: W) -> std::io::Result<()> {
                $(self.write_store(&self.$field, &mut out)?;)*
                Ok(())
            }
        }
    };
}

registry! {
    strings: StringDef => "string",
    system_tree_nodes: SystemTreeNode => "system_tree_node",
    location_groups: LocationGroup => "location_group",
    locations: LocationDef => "location",
    regions: Region => "region",
    regions_groups: RegionsGroup => "regions_group",
    source_code_locations: SourceCodeLocation => "source_code_location",
    calling_contexts: CallingContext => "calling_context",
    calling_context_properties: CallingContextProperty => "calling_context_property",
    comm_groups: CommGroup => "comm_group",
    comms: Comm => "comm",
    metric_members: MetricMember => "metric_member",
    metric_classes: MetricClass => "metric_class",
    metric_instances: MetricInstance => "metric_instance",
    interrupt_generators: InterruptGenerator => "interrupt_generator",
}

#[derive(Serialize)]
struct DefinitionRecord<'a, T> {
    kind: &'static str,
    #[serde(rename = "ref")]
    id: u32,
    #[serde(flatten)]
    def: &'a T,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_store<T: Definition, W: Write>(
        &self,
        store: &Store<T>,
        out: &mut W,
    ) -> std::io::Result<()> {
        for (r, def) in store.iter() {
            let record = DefinitionRecord {
                kind: T::KIND,
                id: r.id(),
                def,
            };
            serde_json::to_writer(&mut *out, &record)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Binds a new definition to `key`. The key must be unused.
    pub fn create<T: Definition>(&mut self, key: Key, value: T) -> Result<Ref<T>> {
        if T::store(self).keys.contains_key(&key) {
            return Err(Error::DuplicateDefinition {
                kind: T::KIND,
                key: key.to_string(),
            });
        }
        let store = T::store_mut(self);
        let r = store.push(value);
        store.keys.insert(key, r);
        Ok(r)
    }

    /// Adds a definition nobody will look up by key.
    pub fn create_unkeyed<T: Definition>(&mut self, value: T) -> Ref<T> {
        T::store_mut(self).push(value)
    }

    /// Returns the definition bound to `key`, building it with `make` if
    /// there is none. `make` may add further definitions it depends on.
    pub fn emplace_with<T, F>(&mut self, key: Key, make: F) -> Ref<T>
    where
        T: Definition,
        F: FnOnce(&mut Registry) -> T,
    {
        if let Some(r) = T::store(self).keys.get(&key) {
            return *r;
        }
        let value = make(self);
        let store = T::store_mut(self);
        let r = store.push(value);
        store.keys.insert(key, r);
        r
    }

    pub fn emplace<T: Definition>(&mut self, key: Key, value: T) -> Ref<T> {
        self.emplace_with(key, |_| value)
    }

    pub fn get<T: Definition>(&self, key: &Key) -> Result<Ref<T>> {
        self.find(key).ok_or_else(|| Error::MissingDefinition {
            kind: T::KIND,
            key: key.to_string(),
        })
    }

    pub fn find<T: Definition>(&self, key: &Key) -> Option<Ref<T>> {
        T::store(self).keys.get(key).copied()
    }

    pub fn has<T: Definition>(&self, key: &Key) -> bool {
        T::store(self).keys.contains_key(key)
    }

    pub fn def<T: Definition>(&self, r: Ref<T>) -> &T {
        &T::store(self).items[r.id as usize]
    }

    pub fn def_mut<T: Definition>(&mut self, r: Ref<T>) -> &mut T {
        &mut T::store_mut(self).items[r.id as usize]
    }

    pub fn all<T: Definition>(&self) -> &Store<T> {
        T::store(self)
    }

    pub fn intern(&mut self, value: &str) -> Ref<StringDef> {
        if let Some(r) = self.find(&Key::ByString(value.to_string())) {
            return r;
        }
        self.emplace(
            Key::ByString(value.to_string()),
            StringDef {
                value: value.to_string(),
            },
        )
    }

    pub fn string(&self, r: Ref<StringDef>) -> &str {
        &self.def(r).value
    }

    /// Region for a resolved address. Its strings are interned in the same
    /// call, and it joins the regions group of its binary.
    pub fn intern_region(&mut self, line_info: &LineInfo) -> Ref<Region> {
        let key = Key::ByLineInfo(line_info.clone());
        if let Some(r) = self.find(&key) {
            return r;
        }
        let name = self.intern(&line_info.function);
        let file = self.intern(&line_info.file);
        let description = self.intern(&line_info.to_string());
        let region = self.create_unchecked(
            key,
            Region {
                name,
                canonical_name: name,
                description,
                role: RegionRole::Function,
                paradigm: Paradigm::Sampling,
                source_file: file,
                begin_line: line_info.line,
                end_line: line_info.line,
            },
        );

        let group_name = self.intern(&line_info.dso);
        let group: Ref<RegionsGroup> = self.emplace(
            Key::ByString(line_info.dso.clone()),
            RegionsGroup {
                name: group_name,
                paradigm: Paradigm::Sampling,
                members: Vec::new(),
            },
        );
        self.def_mut(group).members.push(region);
        region
    }

    pub fn intern_scl(&mut self, line_info: &LineInfo) -> Ref<SourceCodeLocation> {
        let key = Key::ByLineInfo(line_info.clone());
        if let Some(r) = self.find(&key) {
            return r;
        }
        let file = self.intern(&line_info.file);
        self.create_unchecked(
            key,
            SourceCodeLocation {
                file,
                line: line_info.line,
            },
        )
    }

    /// `create` for callers that checked the key themselves.
    fn create_unchecked<T: Definition>(&mut self, key: Key, value: T) -> Ref<T> {
        let store = T::store_mut(self);
        let r = store.push(value);
        store.keys.insert(key, r);
        r
    }
}
