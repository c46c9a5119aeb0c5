/// Tensor arena allocation
///
/// Models request `(size, alignment, tier)` from an `ArenaAllocator` and own
/// the returned `Arena` for as long as they stay loaded. Dropping the arena
/// returns its bytes to the tier it came from.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Alignment required for tensor arenas
pub const ARENA_ALIGNMENT: usize = 64;

/// Default budget of the fast internal tier (192KB)
pub const DEFAULT_INTERNAL_BUDGET: usize = 192 * 1024;

/// Default budget of the large external tier (8MB)
pub const DEFAULT_EXTERNAL_BUDGET: usize = 8 * 1024 * 1024;

/// Memory region an arena is carved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    /// Small, fast on-chip memory
    Internal,

    /// Large, slower external memory
    External,
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryTier::Internal => write!(f, "internal"),
            MemoryTier::External => write!(f, "external"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("{tier} memory exhausted: requested {requested} bytes, {available} available")]
    TierExhausted {
        tier: MemoryTier,
        requested: usize,
        available: usize,
    },

    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("Arena size must be greater than 0")]
    ZeroSize,
}

/// Owned, zero-initialised, aligned byte region
pub struct Arena {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
    tier: MemoryTier,
    ledger: Option<Arc<AtomicUsize>>,
}

impl Arena {
    /// Allocate an arena outside of any tier budget
    pub fn new(size: usize, alignment: usize, tier: MemoryTier) -> Result<Self, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }

        let storage = vec![0u8; size + alignment - 1];
        let offset = storage.as_ptr().align_offset(alignment);

        Ok(Self {
            storage,
            offset,
            len: size,
            tier,
            ledger: None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    /// Zero the whole region
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("tier", &self.tier)
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.fetch_sub(self.len, Ordering::AcqRel);
            debug!("Released {} bytes of {} memory", self.len, self.tier);
        }
    }
}

/// Arena allocation capability
#[cfg_attr(test, mockall::automock)]
pub trait ArenaAllocator: Send + Sync {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        tier: MemoryTier,
    ) -> Result<Arena, AllocError>;
}

/// Allocate from the internal tier, retrying once from the external tier
pub fn allocate_with_fallback(
    allocator: &dyn ArenaAllocator,
    size: usize,
    alignment: usize,
) -> Result<Arena, AllocError> {
    match allocator.allocate(size, alignment, MemoryTier::Internal) {
        Ok(arena) => {
            info!("Allocated tensor arena in internal memory: {} bytes", size);
            Ok(arena)
        }
        Err(e) => {
            warn!("Failed to allocate tensor arena in internal memory ({}), trying external", e);
            let arena = allocator.allocate(size, alignment, MemoryTier::External)?;
            info!(
                "Allocated tensor arena in external memory with {}-byte alignment: {} bytes",
                alignment, size
            );
            Ok(arena)
        }
    }
}

/// Heap-backed allocator that enforces a byte budget per tier
pub struct TieredAllocator {
    internal: TierBudget,
    external: TierBudget,
}

struct TierBudget {
    limit: usize,
    used: Arc<AtomicUsize>,
}

impl TierBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn reserve(&self, tier: MemoryTier, size: usize) -> Result<(), AllocError> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| AllocError::TierExhausted {
                tier,
                requested: size,
                available: self.limit.saturating_sub(used),
            })
    }
}

impl TieredAllocator {
    pub fn new(internal_budget: usize, external_budget: usize) -> Self {
        Self {
            internal: TierBudget::new(internal_budget),
            external: TierBudget::new(external_budget),
        }
    }

    fn budget(&self, tier: MemoryTier) -> &TierBudget {
        match tier {
            MemoryTier::Internal => &self.internal,
            MemoryTier::External => &self.external,
        }
    }

    /// Bytes currently handed out from `tier`
    pub fn in_use(&self, tier: MemoryTier) -> usize {
        self.budget(tier).used.load(Ordering::Acquire)
    }

    /// Bytes still available in `tier`
    pub fn free(&self, tier: MemoryTier) -> usize {
        let budget = self.budget(tier);
        budget.limit.saturating_sub(budget.used.load(Ordering::Acquire))
    }
}

impl Default for TieredAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_INTERNAL_BUDGET, DEFAULT_EXTERNAL_BUDGET)
    }
}

impl ArenaAllocator for TieredAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        tier: MemoryTier,
    ) -> Result<Arena, AllocError> {
        let budget = self.budget(tier);
        budget.reserve(tier, size)?;

        match Arena::new(size, alignment, tier) {
            Ok(mut arena) => {
                arena.ledger = Some(Arc::clone(&budget.used));
                Ok(arena)
            }
            Err(e) => {
                budget.used.fetch_sub(size, Ordering::AcqRel);
                Err(e)
            }
        }
    }
}
