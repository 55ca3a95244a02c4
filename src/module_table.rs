//! Tracked module table
//!
//! The table is built once before tracing starts from the host's live module
//! list (filtered by a whitelist) plus caller-defined custom regions, e.g.
//! unpacked code that the host's module enumerator does not report. It is
//! immutable afterwards, so producers can resolve addresses without locking.
//!
//! Module ids are assigned in table order and are the ids written into both
//! the DRCOV header and every block record.

use crate::error::{CoverageError, Result};
use crate::host::deserialize_address;
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};

/// Whitelist entry meaning "track every host module"
pub const WHITELIST_ALL: &str = "all";

/// Maximum number of modules a u16 module id can address
pub const MAX_MODULES: usize = u16::MAX as usize + 1;

/// A live module as reported by the host engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostModule {
    /// Module name used for whitelist matching (e.g. "libc.so.6")
    pub name: String,
    #[serde(deserialize_with = "deserialize_address")]
    pub base: u64,
    #[serde(deserialize_with = "deserialize_address")]
    pub size: u64,
    /// Full path; the name is used when the host does not report one
    #[serde(default)]
    pub path: Option<String>,
}

impl HostModule {
    pub fn new(name: impl Into<String>, base: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            base,
            size,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// A synthetic region not reported by the host's module enumerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRegion {
    #[serde(deserialize_with = "deserialize_address")]
    pub base: u64,
    #[serde(deserialize_with = "deserialize_address")]
    pub size: u64,
    pub path: String,
}

impl CustomRegion {
    pub fn new(base: u64, size: u64, path: impl Into<String>) -> Self {
        Self {
            base,
            size,
            path: path.into(),
        }
    }
}

/// Module name filter applied to the host module list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Whitelist {
    /// Track every host module
    #[default]
    All,
    /// Track only modules with one of these names
    Names(FnvHashSet<String>),
}

impl Whitelist {
    /// Build a whitelist from names; any `"all"` entry disables filtering
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: FnvHashSet<String> = names.into_iter().map(Into::into).collect();
        if names.contains(WHITELIST_ALL) {
            Whitelist::All
        } else {
            Whitelist::Names(names)
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            Whitelist::All => true,
            Whitelist::Names(names) => names.contains(name),
        }
    }
}

/// A tracked memory region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: u16,
    /// Host module name, or `custom-mod<N>` for custom regions
    pub name: String,
    pub base: u64,
    /// One past the last byte of the region
    pub end: u64,
    pub path: String,
}

impl Module {
    pub fn size(&self) -> u64 {
        self.end - self.base
    }

    pub fn contains(&self, address: u64) -> bool {
        self.base <= address && address < self.end
    }
}

/// Ordered, immutable collection of tracked modules
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    modules: Vec<Module>,
    /// Module indices sorted by base; `None` when ranges overlap
    by_base: Option<Vec<usize>>,
}

impl ModuleTable {
    /// Build the table from the host's live modules and custom regions
    ///
    /// Host modules passing the whitelist get ids `0..N` in host order,
    /// custom regions follow with continuing ids.
    pub fn build(
        host_modules: &[HostModule],
        whitelist: &Whitelist,
        custom: &[CustomRegion],
    ) -> Result<Self> {
        let mut modules = Vec::new();

        for host in host_modules.iter().filter(|m| whitelist.allows(&m.name)) {
            let path = host.path.clone().unwrap_or_else(|| host.name.clone());
            let end = region_end(host.base, host.size, &path)?;
            modules.push(Module {
                id: next_id(modules.len())?,
                name: host.name.clone(),
                base: host.base,
                end,
                path,
            });
        }

        for (index, region) in custom.iter().enumerate() {
            let end = region_end(region.base, region.size, &region.path)?;
            modules.push(Module {
                id: next_id(modules.len())?,
                name: format!("custom-mod{}", index + 1),
                base: region.base,
                end,
                path: region.path.clone(),
            });
        }

        let table = Self::index(modules);
        table.log_modules();
        Ok(table)
    }

    /// Rebuild a table from already-numbered modules
    ///
    /// Ids must run `0..N` in order, since block records reference them.
    pub fn from_modules(modules: Vec<Module>) -> Result<Self> {
        if modules.len() > MAX_MODULES {
            return Err(CoverageError::TooManyModules {
                count: modules.len(),
            });
        }
        for (expected, module) in modules.iter().enumerate() {
            if usize::from(module.id) != expected {
                return Err(CoverageError::NonSequentialId {
                    expected,
                    found: usize::from(module.id),
                });
            }
            if module.base >= module.end {
                return Err(invalid_region(&module.path, "base must be below end"));
            }
            validate_path(&module.path)?;
        }
        Ok(Self::index(modules))
    }

    fn index(modules: Vec<Module>) -> Self {
        let mut sorted: Vec<usize> = (0..modules.len()).collect();
        sorted.sort_by_key(|&i| modules[i].base);

        let overlap = sorted
            .windows(2)
            .find(|pair| modules[pair[1]].base < modules[pair[0]].end)
            .map(|pair| (pair[0], pair[1]));

        let by_base = match overlap {
            Some((first, second)) => {
                tracing::warn!(
                    first = %modules[first].path,
                    second = %modules[second].path,
                    "Overlapping module ranges, lookups fall back to first match by id"
                );
                None
            }
            None => Some(sorted),
        };

        Self { modules, by_base }
    }

    fn log_modules(&self) {
        tracing::info!(count = self.modules.len(), "Collecting coverage from modules");
        for m in &self.modules {
            tracing::info!(
                id = m.id,
                name = %m.name,
                base = format_args!("{:#x}", m.base),
                end = format_args!("{:#x}", m.end),
                path = %m.path,
                "module"
            );
        }
    }

    /// Find the module whose `[base, end)` contains `address`
    ///
    /// With overlapping ranges the lowest id wins.
    pub fn lookup(&self, address: u64) -> Option<&Module> {
        match &self.by_base {
            Some(sorted) => {
                let idx = sorted.partition_point(|&i| self.modules[i].base <= address);
                let module = &self.modules[*sorted.get(idx.checked_sub(1)?)?];
                module.contains(address).then_some(module)
            }
            None => self.modules.iter().find(|m| m.contains(address)),
        }
    }

    pub fn get(&self, id: u16) -> Option<&Module> {
        self.modules.get(usize::from(id))
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn has_overlaps(&self) -> bool {
        self.by_base.is_none()
    }
}

fn next_id(count: usize) -> Result<u16> {
    u16::try_from(count).map_err(|_| CoverageError::TooManyModules { count: count + 1 })
}

fn region_end(base: u64, size: u64, path: &str) -> Result<u64> {
    validate_path(path)?;
    if size == 0 {
        return Err(invalid_region(path, "size must be non-zero"));
    }
    base.checked_add(size)
        .ok_or_else(|| invalid_region(path, "base + size overflows the address space"))
}

fn validate_path(path: &str) -> Result<()> {
    if path.contains(['\n', '\r']) {
        return Err(invalid_region(path, "path contains a line break"));
    }
    Ok(())
}

fn invalid_region(path: &str, reason: &str) -> CoverageError {
    CoverageError::InvalidRegion {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_list() -> Vec<HostModule> {
        vec![
            HostModule::new("a.dll", 0x1000, 0x1000).with_path("C:\\bin\\a.dll"),
            HostModule::new("b.dll", 0x4000, 0x2000),
            HostModule::new("c.dll", 0x8000, 0x100),
        ]
    }

    #[test]
    fn test_build_all_assigns_ids_in_order() {
        let table = ModuleTable::build(&host_list(), &Whitelist::All, &[]).unwrap();
        assert_eq!(table.len(), 3);
        let ids: Vec<u16> = table.modules().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(table.modules()[0].end, 0x2000);
        assert_eq!(table.modules()[0].path, "C:\\bin\\a.dll");
        // Name doubles as path when the host omits one
        assert_eq!(table.modules()[1].path, "b.dll");
    }

    #[test]
    fn test_whitelist_filters_and_renumbers() {
        let whitelist = Whitelist::from_names(["c.dll", "b.dll"]);
        let table = ModuleTable::build(&host_list(), &whitelist, &[]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.modules()[0].name, "b.dll");
        assert_eq!(table.modules()[0].id, 0);
        assert_eq!(table.modules()[1].name, "c.dll");
        assert_eq!(table.modules()[1].id, 1);
    }

    #[test]
    fn test_whitelist_all_sentinel_wins() {
        let whitelist = Whitelist::from_names(["a.dll", "all"]);
        assert_eq!(whitelist, Whitelist::All);
        assert!(whitelist.allows("anything.so"));
    }

    #[test]
    fn test_custom_regions_continue_ids() {
        let whitelist = Whitelist::from_names(["a.dll"]);
        let custom = vec![
            CustomRegion::new(0x10_0000, 0x800, "unpacked-1"),
            CustomRegion::new(0x20_0000, 0x800, "unpacked-2"),
        ];
        let table = ModuleTable::build(&host_list(), &whitelist, &custom).unwrap();
        assert_eq!(table.len(), 3);
        let custom_2 = table.get(2).unwrap();
        assert_eq!(custom_2.name, "custom-mod2");
        assert_eq!(custom_2.path, "unpacked-2");
        assert_eq!(custom_2.end, 0x20_0800);
    }

    #[test]
    fn test_lookup_hits_and_misses() {
        let table = ModuleTable::build(&host_list(), &Whitelist::All, &[]).unwrap();
        assert_eq!(table.lookup(0x1000).map(|m| m.id), Some(0));
        assert_eq!(table.lookup(0x1fff).map(|m| m.id), Some(0));
        assert_eq!(table.lookup(0x2000), None);
        assert_eq!(table.lookup(0x5000).map(|m| m.id), Some(1));
        assert_eq!(table.lookup(0x80ff).map(|m| m.id), Some(2));
        assert_eq!(table.lookup(0x0), None);
        assert_eq!(table.lookup(u64::MAX), None);
    }

    #[test]
    fn test_lookup_unsorted_host_order() {
        let host = vec![
            HostModule::new("high", 0x9000, 0x1000),
            HostModule::new("low", 0x1000, 0x1000),
        ];
        let table = ModuleTable::build(&host, &Whitelist::All, &[]).unwrap();
        assert!(!table.has_overlaps());
        assert_eq!(table.lookup(0x9500).map(|m| m.id), Some(0));
        assert_eq!(table.lookup(0x1500).map(|m| m.id), Some(1));
    }

    #[test]
    fn test_overlap_first_match_by_id() {
        let host = vec![HostModule::new("outer", 0x1000, 0x1000)];
        let custom = vec![CustomRegion::new(0x1800, 0x100, "inner")];
        let table = ModuleTable::build(&host, &Whitelist::All, &custom).unwrap();
        assert!(table.has_overlaps());
        assert_eq!(table.lookup(0x1850).map(|m| m.id), Some(0));
    }

    #[test]
    fn test_zero_size_region_rejected() {
        let host = vec![HostModule::new("empty", 0x1000, 0)];
        let err = ModuleTable::build(&host, &Whitelist::All, &[]).unwrap_err();
        assert!(matches!(err, CoverageError::InvalidRegion { .. }));
    }

    #[test]
    fn test_overflowing_region_rejected() {
        let custom = vec![CustomRegion::new(u64::MAX - 4, 0x10, "wrap")];
        let err = ModuleTable::build(&[], &Whitelist::All, &custom).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_path_with_newline_rejected() {
        let custom = vec![CustomRegion::new(0x1000, 0x10, "bad\npath")];
        assert!(ModuleTable::build(&[], &Whitelist::All, &custom).is_err());
    }

    #[test]
    fn test_from_modules_requires_sequential_ids() {
        let modules = vec![Module {
            id: 1,
            name: "a".to_string(),
            base: 0x1000,
            end: 0x2000,
            path: "a".to_string(),
        }];
        let err = ModuleTable::from_modules(modules).unwrap_err();
        assert!(matches!(
            err,
            CoverageError::NonSequentialId {
                expected: 0,
                found: 1
            }
        ));
    }

    #[test]
    fn test_empty_table_never_resolves() {
        let table = ModuleTable::default();
        assert!(table.is_empty());
        assert_eq!(table.lookup(0x1000), None);
    }
}
