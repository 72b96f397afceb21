use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{IoConfig, PortsConfig};
use crate::error::{MusterError, Result};
use crate::store::{atomic, lock};

/// An inclusive, contiguous block of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range.
    pub fn width(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = MusterError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MusterError::Invalid(format!("port range '{s}' must look like 3000-3009"));
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start: u16 = start.trim().parse().map_err(|_| invalid())?;
        let end: u16 = end.trim().parse().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

/// One reserved range and who holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub range: PortRange,
    pub owner: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllocationTable {
    #[serde(default)]
    allocations: Vec<Allocation>,
}

/// Hands out non-overlapping port ranges from `[base, limit)`.
///
/// The table lives in `.muster/ports.json` and is only ever rewritten under
/// the ports lock, so concurrent allocators in different processes cannot
/// hand out intersecting ranges.
pub struct PortAllocator {
    root: PathBuf,
    ports: PortsConfig,
    io: IoConfig,
}

impl PortAllocator {
    pub fn open(muster_root: &Path, ports: PortsConfig, io: IoConfig) -> Self {
        Self {
            root: muster_root.to_path_buf(),
            ports,
            io,
        }
    }

    fn table_path(&self) -> PathBuf {
        self.root.join("ports.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("locks").join("ports.lock")
    }

    fn read_table(&self) -> Result<AllocationTable> {
        Ok(atomic::read_json(&self.table_path())?.unwrap_or_default())
    }

    fn write_table(&self, table: &AllocationTable) -> Result<()> {
        atomic::write_json(&self.table_path(), table, &self.io)
    }

    pub fn default_width(&self) -> u16 {
        self.ports.width
    }

    /// Reserve the lowest free contiguous range of `size` ports.
    pub fn allocate(&self, size: u16, owner: &str) -> Result<PortRange> {
        if size == 0 {
            return Err(MusterError::Invalid("port range size must be positive".into()));
        }
        if owner.trim().is_empty() {
            return Err(MusterError::Invalid("port range owner must be non-empty".into()));
        }
        let lock = lock::acquire_lock(&self.lock_path(), &self.io)?;
        let mut table = self.read_table()?;

        let range = lowest_fit(&table.allocations, size, self.ports.base, self.ports.limit)
            .ok_or(MusterError::PortsExhausted {
                size: u32::from(size),
                base: self.ports.base,
                limit: self.ports.limit,
            })?;

        table.allocations.push(Allocation {
            range,
            owner: owner.to_string(),
            allocated_at: Utc::now(),
        });
        table.allocations.sort_by_key(|a| a.range);
        self.write_table(&table)?;

        lock::release_lock(lock)?;
        tracing::info!(%range, owner, "allocated port range");
        Ok(range)
    }

    /// Return `range` to the pool. It must match a current allocation exactly.
    pub fn release(&self, range: PortRange) -> Result<()> {
        let lock = lock::acquire_lock(&self.lock_path(), &self.io)?;
        let mut table = self.read_table()?;

        let Some(pos) = table.allocations.iter().position(|a| a.range == range) else {
            lock::release_lock(lock)?;
            return Err(MusterError::PortRangeNotAllocated(range));
        };
        let released = table.allocations.remove(pos);
        self.write_table(&table)?;

        lock::release_lock(lock)?;
        tracing::info!(%range, owner = %released.owner, "released port range");
        Ok(())
    }

    /// Release every range held by `owner`. Returns what was released.
    pub fn release_owner(&self, owner: &str) -> Result<Vec<PortRange>> {
        let lock = lock::acquire_lock(&self.lock_path(), &self.io)?;
        let mut table = self.read_table()?;

        let (released, kept): (Vec<Allocation>, Vec<Allocation>) =
            table.allocations.into_iter().partition(|a| a.owner == owner);
        table.allocations = kept;
        if !released.is_empty() {
            self.write_table(&table)?;
        }

        lock::release_lock(lock)?;
        let ranges: Vec<PortRange> = released.into_iter().map(|a| a.range).collect();
        if !ranges.is_empty() {
            tracing::info!(owner, count = ranges.len(), "released owner's port ranges");
        }
        Ok(ranges)
    }

    /// Current allocations ordered by range.
    pub fn list(&self) -> Result<Vec<Allocation>> {
        let mut allocations = self.read_table()?.allocations;
        allocations.sort_by_key(|a| a.range);
        Ok(allocations)
    }

    pub fn is_allocated(&self, range: PortRange) -> Result<bool> {
        Ok(self.read_table()?.allocations.iter().any(|a| a.range == range))
    }
}

/// First gap of `size` ports in `[base, limit)` not overlapping `taken`.
fn lowest_fit(taken: &[Allocation], size: u16, base: u16, limit: u16) -> Option<PortRange> {
    let mut ranges: Vec<PortRange> = taken.iter().map(|a| a.range).collect();
    ranges.sort();

    let size = u32::from(size);
    let limit = u32::from(limit);
    let mut candidate = u32::from(base);
    for held in ranges {
        let held_start = u32::from(held.start);
        let held_end = u32::from(held.end);
        if held_end < candidate {
            continue;
        }
        if candidate + size <= held_start {
            break;
        }
        candidate = held_end + 1;
    }
    if candidate + size > limit {
        return None;
    }
    let end = candidate + size - 1;
    Some(PortRange::new(u16::try_from(candidate).ok()?, u16::try_from(end).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn allocator(dir: &Path) -> PortAllocator {
        PortAllocator::open(dir, PortsConfig::default(), IoConfig::default())
    }

    fn alloc(start: u16, end: u16) -> Allocation {
        Allocation {
            range: PortRange::new(start, end),
            owner: "t".into(),
            allocated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_and_displays_ranges() {
        let range: PortRange = "3010-3019".parse().unwrap();
        assert_eq!(range, PortRange::new(3010, 3019));
        assert_eq!(range.to_string(), "3010-3019");
        assert_eq!(range.width(), 10);
        assert!("3019-3010".parse::<PortRange>().is_err());
        assert!("3010".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
    }

    #[test]
    fn overlap_is_inclusive() {
        let a = PortRange::new(3000, 3009);
        assert!(a.overlaps(&PortRange::new(3009, 3010)));
        assert!(!a.overlaps(&PortRange::new(3010, 3019)));
    }

    #[test]
    fn lowest_fit_fills_gaps_first() {
        let taken = vec![alloc(3000, 3009), alloc(3020, 3029)];
        assert_eq!(
            lowest_fit(&taken, 10, 3000, 4000),
            Some(PortRange::new(3010, 3019))
        );
        // Too wide for the gap, goes after the last allocation.
        assert_eq!(
            lowest_fit(&taken, 11, 3000, 4000),
            Some(PortRange::new(3030, 3040))
        );
    }

    #[test]
    fn lowest_fit_respects_limit() {
        assert_eq!(
            lowest_fit(&[], 10, 3000, 3010),
            Some(PortRange::new(3000, 3009))
        );
        assert_eq!(lowest_fit(&[], 11, 3000, 3010), None);
        assert_eq!(lowest_fit(&[alloc(3000, 3004)], 6, 3000, 3010), None);
    }

    #[test]
    fn lowest_fit_near_u16_max_does_not_overflow() {
        assert_eq!(
            lowest_fit(&[], 10, 65526, u16::MAX),
            None,
            "limit is exclusive so 65535 itself is never handed out"
        );
        assert_eq!(
            lowest_fit(&[], 9, 65526, u16::MAX),
            Some(PortRange::new(65526, 65534))
        );
    }

    #[test]
    fn allocate_twice_gives_adjacent_disjoint_ranges() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path());
        let a = ports.allocate(10, "a").unwrap();
        let b = ports.allocate(10, "b").unwrap();
        assert_eq!(a, PortRange::new(3000, 3009));
        assert_eq!(b, PortRange::new(3010, 3019));
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn released_range_is_reused() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path());
        let a = ports.allocate(10, "a").unwrap();
        ports.allocate(10, "b").unwrap();
        ports.release(a).unwrap();
        assert_eq!(ports.allocate(10, "c").unwrap(), a);
    }

    #[test]
    fn double_release_is_validation_error() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path());
        let a = ports.allocate(10, "a").unwrap();
        ports.release(a).unwrap();
        assert!(matches!(
            ports.release(a),
            Err(MusterError::PortRangeNotAllocated(r)) if r == a
        ));
        // A sub-range of an allocation is not an allocation either.
        let b = ports.allocate(10, "b").unwrap();
        assert!(ports.release(PortRange::new(b.start, b.start + 4)).is_err());
    }

    #[test]
    fn exhaustion_is_reported() {
        let dir = tempdir().unwrap();
        let config = PortsConfig {
            base: 3000,
            limit: 3020,
            width: 10,
        };
        let ports = PortAllocator::open(dir.path(), config, IoConfig::default());
        ports.allocate(10, "a").unwrap();
        ports.allocate(10, "b").unwrap();
        assert!(matches!(
            ports.allocate(10, "c"),
            Err(MusterError::PortsExhausted { size: 10, .. })
        ));
    }

    #[test]
    fn zero_size_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            allocator(dir.path()).allocate(0, "a"),
            Err(MusterError::Invalid(_))
        ));
    }

    #[test]
    fn release_owner_frees_all_of_its_ranges() {
        let dir = tempdir().unwrap();
        let ports = allocator(dir.path());
        ports.allocate(10, "a").unwrap();
        let b = ports.allocate(5, "b").unwrap();
        ports.allocate(10, "a").unwrap();

        let released = ports.release_owner("a").unwrap();
        assert_eq!(released.len(), 2);
        let remaining: Vec<PortRange> = ports.list().unwrap().iter().map(|a| a.range).collect();
        assert_eq!(remaining, vec![b]);
        assert!(ports.release_owner("a").unwrap().is_empty());
    }
}
