//! Large-object space backed by one anonymous mapping per object.

use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use crate::object::ObjRef;
use crate::os::{MemMap, PAGE_SIZE, Protection, checked_round_up};
use crate::space::{Allocation, ObjectBitmaps, Space, SpaceCounters};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const COMPONENT: &str = "large-object-map";

#[derive(Debug)]
struct LargeObject {
    mem_map: MemMap,
    usable: usize,
    is_zygote: bool,
}

#[derive(Debug)]
struct MapState {
    objects: BTreeMap<ObjRef, LargeObject>,
    counters: SpaceCounters,
}

/// Discontiguous large-object space.
///
/// `begin`/`end` form a bounding box over every mapping ever inserted; it
/// only widens.
pub struct LargeObjectMapSpace {
    name: String,
    /// Guard bytes on each side of an object; zero when guards are off.
    red_zone: usize,
    begin: AtomicUsize,
    end: AtomicUsize,
    state: Mutex<MapState>,
    bitmaps: ObjectBitmaps,
    log: Arc<HeapLog>,
}

impl LargeObjectMapSpace {
    #[must_use]
    pub fn new(name: &str, log: Arc<HeapLog>) -> Self {
        Self::build(name, 0, log)
    }

    /// Every object is surrounded by one inaccessible page on each side.
    #[must_use]
    pub fn with_guard_pages(name: &str, log: Arc<HeapLog>) -> Self {
        Self::build(name, PAGE_SIZE, log)
    }

    fn build(name: &str, red_zone: usize, log: Arc<HeapLog>) -> Self {
        Self {
            name: name.to_string(),
            red_zone,
            begin: AtomicUsize::new(usize::MAX),
            end: AtomicUsize::new(0),
            state: Mutex::new(MapState {
                objects: BTreeMap::new(),
                counters: SpaceCounters::default(),
            }),
            bitmaps: ObjectBitmaps::default(),
            log,
        }
    }

    /// Map a fresh region for an `n`-byte object. `None` when the kernel refuses.
    pub fn alloc(&self, n: usize) -> Option<Allocation> {
        let total = n
            .checked_add(2 * self.red_zone)
            .and_then(|t| checked_round_up(t, PAGE_SIZE))?;
        let mem_map = match MemMap::map_anonymous(&self.name, total, Protection::ReadWrite) {
            Ok(map) => map,
            Err(e) => {
                self.log.emit(
                    LogEvent::new(HeapLogLevel::Warn, COMPONENT, "alloc")
                        .size(n)
                        .outcome("map_failed")
                        .details(e.to_string()),
                );
                return None;
            }
        };
        if self.red_zone > 0 {
            let tail = mem_map.end() - self.red_zone;
            if let Err(e) = mem_map
                .protect(mem_map.begin(), self.red_zone, Protection::None)
                .and_then(|()| mem_map.protect(tail, self.red_zone, Protection::None))
            {
                self.log.fatal(COMPONENT, "guard", format!("mprotect failed: {e}"));
            }
        }
        let obj = ObjRef::from_addr(mem_map.begin() + self.red_zone)?;
        let allocation_size = mem_map.size();
        let usable_size = if self.red_zone > 0 { n } else { allocation_size };
        let (map_begin, map_end) = (mem_map.begin(), mem_map.end());
        {
            let mut state = self.state.lock();
            state.objects.insert(
                obj,
                LargeObject {
                    mem_map,
                    usable: usable_size,
                    is_zygote: false,
                },
            );
            state.counters.on_alloc(allocation_size);
            self.begin.fetch_min(map_begin, Ordering::AcqRel);
            self.end.fetch_max(map_end, Ordering::AcqRel);
        }
        self.bitmaps.set_live(obj);
        Some(Allocation {
            obj,
            bytes_allocated: allocation_size,
            usable_size,
            bytes_tl_bulk_allocated: allocation_size,
        })
    }

    /// Unmap `obj`, returning the bytes it was charged. Unknown objects abort.
    pub fn free(&self, obj: ObjRef) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.objects.remove(&obj);
            if let Some(large) = &removed {
                state.counters.on_free(large.mem_map.size());
            }
            removed
        };
        let Some(large) = removed else {
            self.log.fatal(
                COMPONENT,
                "free",
                format!(
                    "attempted to free large object {:#x} which was not live; {}",
                    obj.addr(),
                    self.dump()
                ),
            );
        };
        self.bitmaps.clear_live(obj);
        let bytes = large.mem_map.size();
        drop(large);
        bytes
    }

    /// `(bytes_allocated, usable_size)` of a live object.
    #[must_use]
    pub fn allocation_size(&self, obj: ObjRef) -> Option<(usize, usize)> {
        let state = self.state.lock();
        state
            .objects
            .get(&obj)
            .map(|large| (large.mem_map.size(), large.usable))
    }

    #[must_use]
    pub fn contains_object(&self, obj: ObjRef) -> bool {
        self.state.lock().objects.contains_key(&obj)
    }

    /// Whether `obj` predates the last zygote fork. Unknown objects abort.
    pub fn is_zygote_large_object(&self, obj: ObjRef) -> bool {
        let flag = self.state.lock().objects.get(&obj).map(|l| l.is_zygote);
        match flag {
            Some(is_zygote) => is_zygote,
            None => self.log.fatal(
                COMPONENT,
                "is_zygote",
                format!("{:#x} is not a large object of {}", obj.addr(), self.name),
            ),
        }
    }

    pub fn set_all_large_objects_as_zygote_objects(&self, set_mark_bit: bool) {
        let mut state = self.state.lock();
        for (obj, large) in &mut state.objects {
            large.is_zygote = true;
            if set_mark_bit {
                self.bitmaps.set_marked(*obj);
            }
        }
    }

    /// Visit `(start, end, used_bytes)` of every object, in address order.
    pub fn walk(&self, mut callback: impl FnMut(usize, usize, usize)) {
        let state = self.state.lock();
        for (obj, large) in &state.objects {
            callback(obj.addr(), obj.addr() + large.usable, large.usable);
        }
    }

    pub fn for_each_mem_map(&self, mut f: impl FnMut(&MemMap)) {
        let state = self.state.lock();
        for large in state.objects.values() {
            f(&large.mem_map);
        }
    }

    /// Bounding box read under the lock, so both ends are consistent.
    #[must_use]
    pub fn begin_end_atomic(&self) -> (usize, usize) {
        let _state = self.state.lock();
        (self.begin(), self.end())
    }

    #[must_use]
    pub fn counters(&self) -> SpaceCounters {
        self.state.lock().counters
    }

    #[must_use]
    pub fn bitmaps(&self) -> &ObjectBitmaps {
        &self.bitmaps
    }

    #[must_use]
    pub fn guard_size(&self) -> usize {
        self.red_zone
    }
}

impl Space for LargeObjectMapSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self) -> usize {
        let begin = self.begin.load(Ordering::Acquire);
        if begin == usize::MAX { 0 } else { begin }
    }

    fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    fn dump(&self) -> String {
        let state = self.state.lock();
        let mut out = format!(
            "{} begin={:#x} end={:#x} objects={} bytes={}\n",
            self.name,
            self.begin(),
            self.end(),
            state.counters.objects_allocated,
            state.counters.bytes_allocated
        );
        for (obj, large) in &state.objects {
            out.push_str(&format!(
                "  {:#x} size={:#x}{}\n",
                obj.addr(),
                large.mem_map.size(),
                if large.is_zygote { " zygote" } else { "" }
            ));
        }
        out
    }
}
