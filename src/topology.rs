//! Packages, cores and CPUs of the host as exported under
//! /sys/devices/system/cpu.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

const SYSFS_CPU: &str = "/sys/devices/system/cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cpu {
    pub id: u32,
    pub core_id: u32,
    pub package_id: u32,
}

/// A core is only unique within its package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Core {
    pub id: u32,
    pub package_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    cpus: BTreeMap<u32, Cpu>,
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<u32>> {
    let mut cpu_ids = Vec::new();
    for group in cpulist.trim().trim_end_matches('\0').split(',') {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        let (min, max) = match group.split_once('-') {
            Some((min, max)) => (min.parse::<u32>(), max.parse::<u32>()),
            None => (group.parse::<u32>(), group.parse::<u32>()),
        };
        match (min, max) {
            (Ok(min), Ok(max)) if min <= max => cpu_ids.extend(min..=max),
            _ => bail!("Failed to parse cpulist {}", group),
        }
    }
    Ok(cpu_ids)
}

fn read_topology_id(path: &Path) -> Result<u32> {
    let val = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    // Some hypervisors report -1 for the package.
    match val.trim().parse::<i64>() {
        Ok(id) => Ok(id.max(0) as u32),
        Err(_) => bail!("Failed to parse {} from {}", val.trim(), path.display()),
    }
}

impl Topology {
    pub fn probe() -> Result<Self> {
        Self::from_sysfs(Path::new(SYSFS_CPU))
    }

    /// Reads the online CPUs and their package/core ids below `root`.
    pub fn from_sysfs(root: &Path) -> Result<Self> {
        let online = fs::read_to_string(root.join("online"))
            .with_context(|| format!("reading {}/online", root.display()))?;

        let mut cpus = BTreeMap::new();
        for id in read_cpulist(&online)? {
            let topology: PathBuf = root.join(format!("cpu{id}")).join("topology");
            let core_id = read_topology_id(&topology.join("core_id"))?;
            let package_id = read_topology_id(&topology.join("physical_package_id"))?;
            cpus.insert(
                id,
                Cpu {
                    id,
                    core_id,
                    package_id,
                },
            );
        }
        if cpus.is_empty() {
            bail!("no online CPUs found in {}", root.display());
        }
        Ok(Topology { cpus })
    }

    pub fn from_cpus<I: IntoIterator<Item = Cpu>>(cpus: I) -> Self {
        Topology {
            cpus: cpus.into_iter().map(|cpu| (cpu.id, cpu)).collect(),
        }
    }

    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.values()
    }

    pub fn cores(&self) -> BTreeSet<Core> {
        self.cpus
            .values()
            .map(|cpu| Core {
                id: cpu.core_id,
                package_id: cpu.package_id,
            })
            .collect()
    }

    pub fn packages(&self) -> BTreeSet<u32> {
        self.cpus.values().map(|cpu| cpu.package_id).collect()
    }

    pub fn cpu(&self, id: u32) -> Option<&Cpu> {
        self.cpus.get(&id)
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_cpu(root: &Path, id: u32, core: i64, package: i64) {
        let dir = root.join(format!("cpu{id}/topology"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("core_id"), format!("{core}\n")).unwrap();
        fs::write(dir.join("physical_package_id"), format!("{package}\n")).unwrap();
    }

    #[test]
    fn test_read_cpulist() {
        assert_eq!(read_cpulist("0-3,5\n").unwrap(), vec![0, 1, 2, 3, 5]);
        assert_eq!(read_cpulist("7").unwrap(), vec![7]);
        assert!(read_cpulist("3-1").is_err());
        assert!(read_cpulist("x").is_err());
    }

    #[test]
    fn test_topology_from_sysfs() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("online"), "0-2,4\n").unwrap();
        fake_cpu(tmp.path(), 0, 0, 0);
        fake_cpu(tmp.path(), 1, 0, 0);
        fake_cpu(tmp.path(), 2, 1, 0);
        // Offline CPUs are skipped even when their directory exists.
        fake_cpu(tmp.path(), 3, 1, 0);
        fake_cpu(tmp.path(), 4, 0, 1);

        let topology = Topology::from_sysfs(tmp.path()).unwrap();
        assert_eq!(topology.nr_cpus(), 4);
        assert!(topology.cpu(3).is_none());
        assert_eq!(topology.packages().len(), 2);
        assert_eq!(topology.cores().len(), 3);
        assert_eq!(topology.cpu(4).unwrap().package_id, 1);
    }

    #[test]
    fn test_negative_package_id() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("online"), "0\n").unwrap();
        fake_cpu(tmp.path(), 0, 0, -1);
        let topology = Topology::from_sysfs(tmp.path()).unwrap();
        assert_eq!(topology.cpu(0).unwrap().package_id, 0);
    }
}
