//! Heap configuration.
//!
//! [`HeapConfig`] carries every tunable of the allocation engine. Defaults can
//! be overridden with `MHEAP_*` environment variables through
//! [`HeapConfig::from_env`]:
//!
//! | variable | field |
//! |---|---|
//! | `MHEAP_TARGET_FOOTPRINT` | `initial_target_footprint` |
//! | `MHEAP_GROWTH_LIMIT` | `growth_limit` |
//! | `MHEAP_CAPACITY` | `capacity` |
//! | `MHEAP_CONCURRENT_START` | `concurrent_start_bytes` |
//! | `MHEAP_CONCURRENT_GC` | `concurrent_gc` |
//! | `MHEAP_LARGE_OBJECT_THRESHOLD` | `large_object_threshold` |
//! | `MHEAP_LARGE_OBJECT_SPACE` | `large_object_space` (`disabled`, `map`, `free-list`) |
//! | `MHEAP_LARGE_OBJECT_CAPACITY` | `large_object_space_capacity` |
//! | `MHEAP_GUARD_LARGE_OBJECTS` | `guard_large_objects` |
//! | `MHEAP_BUMP_CAPACITY` | `bump_pointer_capacity` |
//! | `MHEAP_SMALL_OBJECT_CAPACITY` | `small_object_capacity` |
//! | `MHEAP_ALLOCATOR` | `default_allocator` |
//! | `MHEAP_TLAB_SIZE` | `tlab_size` |
//! | `MHEAP_ALLOC_STACK` | `allocation_stack_capacity` |
//! | `MHEAP_MAX_RESTARTS` | `max_allocation_restarts` |
//! | `MHEAP_STATS` | `stats_enabled` |
//! | `MHEAP_ALLOC_TRACKING` | `allocation_tracking_capacity` |
//! | `MHEAP_LOG_LEVEL` / `MHEAP_LOG_CAPACITY` | log sink |
//! | `MHEAP_VERIFY` | `verify` (`fast`, `checked`) |
//!
//! Sizes accept `k`, `m` and `g` suffixes.

use crate::dispatch::AllocatorKind;
use crate::error::HeapError;
use crate::log::HeapLogLevel;
use crate::os::{PAGE_SIZE, is_aligned};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Which large-object space the heap builds, if any.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LargeObjectSpaceKind {
    Disabled,
    /// One OS mapping per object.
    Map,
    /// Best-fit free list over a single mapping.
    #[default]
    FreeList,
}

impl LargeObjectSpaceKind {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "none" | "off" => Some(Self::Disabled),
            "map" | "mmap" => Some(Self::Map),
            "free-list" | "freelist" | "free_list" | "fl" => Some(Self::FreeList),
            _ => None,
        }
    }
}

/// How much self-checking the spaces perform.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyLevel {
    #[default]
    Fast,
    /// Protect freed large-object pages read-only, verify object sizes after
    /// construction and audit the free-list side table after every operation.
    Checked,
}

impl VerifyLevel {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "checked" | "debug" | "verify" | "on" | "1" => Self::Checked,
            _ => Self::Fast,
        }
    }

    #[must_use]
    pub const fn is_checked(self) -> bool {
        matches!(self, Self::Checked)
    }

    const fn build_default() -> Self {
        if cfg!(debug_assertions) {
            Self::Checked
        } else {
            Self::Fast
        }
    }
}

// 0=unresolved, 1=Fast, 2=Checked, 255=resolving.
static CACHED_VERIFY: AtomicU8 = AtomicU8::new(0);

const VERIFY_UNRESOLVED: u8 = 0;
const VERIFY_FAST: u8 = 1;
const VERIFY_CHECKED: u8 = 2;
const VERIFY_RESOLVING: u8 = 255;

fn verify_to_u8(level: VerifyLevel) -> u8 {
    match level {
        VerifyLevel::Fast => VERIFY_FAST,
        VerifyLevel::Checked => VERIFY_CHECKED,
    }
}

fn u8_to_verify(v: u8) -> VerifyLevel {
    match v {
        VERIFY_CHECKED => VerifyLevel::Checked,
        VERIFY_FAST => VerifyLevel::Fast,
        _ => VerifyLevel::build_default(),
    }
}

/// Process-wide verify level from `MHEAP_VERIFY`, resolved once.
///
/// Concurrent or reentrant callers that arrive while another caller is
/// reading the environment get the build default.
#[must_use]
pub fn verify_level() -> VerifyLevel {
    let cached = CACHED_VERIFY.load(Ordering::Acquire);
    if cached != VERIFY_UNRESOLVED && cached != VERIFY_RESOLVING {
        return u8_to_verify(cached);
    }
    if cached == VERIFY_RESOLVING
        || CACHED_VERIFY
            .compare_exchange(
                VERIFY_UNRESOLVED,
                VERIFY_RESOLVING,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
    {
        return u8_to_verify(CACHED_VERIFY.load(Ordering::Acquire));
    }
    let level = std::env::var("MHEAP_VERIFY")
        .map(|v| VerifyLevel::from_str_loose(&v))
        .unwrap_or_else(|_| VerifyLevel::build_default());
    CACHED_VERIFY.store(verify_to_u8(level), Ordering::Release);
    level
}

/// Tunables for a [`Heap`](crate::heap::Heap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    pub initial_target_footprint: usize,
    pub growth_limit: usize,
    /// Ceiling the growth limit is raised to by `clear_growth_limit`.
    pub capacity: usize,
    /// Bulk allocation total at which a concurrent collection is requested.
    pub concurrent_start_bytes: usize,
    pub concurrent_gc: bool,
    /// Primitive arrays and strings at least this large go to the large-object space.
    pub large_object_threshold: usize,
    pub large_object_space: LargeObjectSpaceKind,
    /// Region size of the free-list large-object space.
    pub large_object_space_capacity: usize,
    /// Surround map-space objects with inaccessible guard pages.
    pub guard_large_objects: bool,
    /// Bump-pointer region size; zero disables BumpPointer and Tlab.
    pub bump_pointer_capacity: usize,
    /// Capacity of each built-in size-class space.
    pub small_object_capacity: usize,
    pub default_allocator: AllocatorKind,
    /// Extra bytes carved with every new thread-local buffer.
    pub tlab_size: usize,
    pub allocation_stack_capacity: usize,
    pub thread_local_allocation_stack_size: usize,
    pub max_allocation_restarts: usize,
    pub stats_enabled: bool,
    /// Most recent allocations kept by allocation tracking; zero disables it.
    pub allocation_tracking_capacity: usize,
    pub log_level: HeapLogLevel,
    pub log_capacity: usize,
    pub verify: VerifyLevel,
}

impl Default for HeapConfig {
    fn default() -> Self {
        let initial_target_footprint = 4 * MIB;
        Self {
            initial_target_footprint,
            growth_limit: 64 * MIB,
            capacity: 256 * MIB,
            concurrent_start_bytes: initial_target_footprint - 128 * KIB,
            concurrent_gc: true,
            large_object_threshold: 3 * PAGE_SIZE,
            large_object_space: LargeObjectSpaceKind::FreeList,
            large_object_space_capacity: 64 * MIB,
            guard_large_objects: false,
            bump_pointer_capacity: 16 * MIB,
            small_object_capacity: 32 * MIB,
            default_allocator: AllocatorKind::RosAlloc,
            tlab_size: 32 * KIB,
            allocation_stack_capacity: 64 * KIB,
            thread_local_allocation_stack_size: 128,
            max_allocation_restarts: 8,
            stats_enabled: false,
            allocation_tracking_capacity: 0,
            log_level: HeapLogLevel::Info,
            log_capacity: 4096,
            verify: verify_level(),
        }
    }
}

impl HeapConfig {
    /// Defaults overlaid with `MHEAP_*` environment variables.
    pub fn from_env() -> Result<Self, HeapError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values produced by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HeapError> {
        let mut config = Self::default();
        let size = |key: &str, slot: &mut usize| -> Result<(), HeapError> {
            if let Some(raw) = lookup(key) {
                *slot = parse_size(&raw)
                    .ok_or_else(|| HeapError::Config(format!("{key}: bad size '{raw}'")))?;
            }
            Ok(())
        };
        size("MHEAP_TARGET_FOOTPRINT", &mut config.initial_target_footprint)?;
        size("MHEAP_GROWTH_LIMIT", &mut config.growth_limit)?;
        size("MHEAP_CAPACITY", &mut config.capacity)?;
        config.concurrent_start_bytes = config.initial_target_footprint.saturating_sub(128 * KIB);
        size("MHEAP_CONCURRENT_START", &mut config.concurrent_start_bytes)?;
        size("MHEAP_LARGE_OBJECT_THRESHOLD", &mut config.large_object_threshold)?;
        size("MHEAP_LARGE_OBJECT_CAPACITY", &mut config.large_object_space_capacity)?;
        size("MHEAP_BUMP_CAPACITY", &mut config.bump_pointer_capacity)?;
        size("MHEAP_SMALL_OBJECT_CAPACITY", &mut config.small_object_capacity)?;
        size("MHEAP_TLAB_SIZE", &mut config.tlab_size)?;
        size("MHEAP_ALLOC_STACK", &mut config.allocation_stack_capacity)?;
        size("MHEAP_MAX_RESTARTS", &mut config.max_allocation_restarts)?;
        size("MHEAP_ALLOC_TRACKING", &mut config.allocation_tracking_capacity)?;
        size("MHEAP_LOG_CAPACITY", &mut config.log_capacity)?;

        let flag = |key: &str, slot: &mut bool| -> Result<(), HeapError> {
            if let Some(raw) = lookup(key) {
                *slot = parse_bool(&raw)
                    .ok_or_else(|| HeapError::Config(format!("{key}: bad flag '{raw}'")))?;
            }
            Ok(())
        };
        flag("MHEAP_CONCURRENT_GC", &mut config.concurrent_gc)?;
        flag("MHEAP_GUARD_LARGE_OBJECTS", &mut config.guard_large_objects)?;
        flag("MHEAP_STATS", &mut config.stats_enabled)?;

        if let Some(raw) = lookup("MHEAP_LARGE_OBJECT_SPACE") {
            config.large_object_space = LargeObjectSpaceKind::from_str_loose(&raw).ok_or_else(
                || HeapError::Config(format!("MHEAP_LARGE_OBJECT_SPACE: unknown kind '{raw}'")),
            )?;
        }
        if let Some(raw) = lookup("MHEAP_ALLOCATOR") {
            config.default_allocator = AllocatorKind::from_str_loose(&raw).ok_or_else(|| {
                HeapError::Config(format!("MHEAP_ALLOCATOR: unknown allocator '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup("MHEAP_LOG_LEVEL") {
            config.log_level = HeapLogLevel::from_str_loose(&raw);
        }
        if let Some(raw) = lookup("MHEAP_VERIFY") {
            config.verify = VerifyLevel::from_str_loose(&raw);
        }
        Ok(config)
    }

    /// Reject settings the heap cannot honor.
    pub fn validate(&self) -> Result<(), HeapError> {
        let fail = |msg: String| Err(HeapError::Config(msg));
        if self.initial_target_footprint == 0 {
            return fail("initial target footprint must be nonzero".into());
        }
        if self.initial_target_footprint > self.growth_limit {
            return fail(format!(
                "initial target footprint {} exceeds growth limit {}",
                self.initial_target_footprint, self.growth_limit
            ));
        }
        if self.growth_limit > self.capacity {
            return fail(format!(
                "growth limit {} exceeds capacity {}",
                self.growth_limit, self.capacity
            ));
        }
        if self.large_object_space == LargeObjectSpaceKind::FreeList
            && (self.large_object_space_capacity == 0
                || !is_aligned(self.large_object_space_capacity, PAGE_SIZE))
        {
            return fail(format!(
                "free-list capacity {} must be a nonzero multiple of {PAGE_SIZE}",
                self.large_object_space_capacity
            ));
        }
        if !is_aligned(self.tlab_size, crate::space::bump_pointer::BUMP_ALIGNMENT) {
            return fail(format!("tlab size {} is not 8-byte aligned", self.tlab_size));
        }
        if self.max_allocation_restarts == 0 {
            return fail("max allocation restarts must be nonzero".into());
        }
        if self.thread_local_allocation_stack_size == 0
            || self.thread_local_allocation_stack_size > self.allocation_stack_capacity
        {
            return fail(format!(
                "thread-local allocation stack size {} must be in 1..={}",
                self.thread_local_allocation_stack_size, self.allocation_stack_capacity
            ));
        }
        let supported = match self.default_allocator {
            AllocatorKind::BumpPointer | AllocatorKind::Tlab => self.bump_pointer_capacity > 0,
            AllocatorKind::LargeObject => {
                self.large_object_space != LargeObjectSpaceKind::Disabled
            }
            AllocatorKind::RosAlloc | AllocatorKind::DlMalloc | AllocatorKind::NonMoving => {
                self.small_object_capacity > 0
            }
        };
        if !supported {
            return fail(format!(
                "default allocator {} has no backing space",
                self.default_allocator
            ));
        }
        Ok(())
    }
}

/// Parse `"512"`, `"64k"`, `"16M"`, `"1g"`.
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: usize = digits.trim().parse().ok()?;
    value.checked_mul(1usize << shift)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
