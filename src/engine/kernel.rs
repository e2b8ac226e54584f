//! Effect kernels: the DSP state behind each effect unit.
//!
//! Kernels live in a fixed-size arena owned by whoever runs the pipeline.
//! The control side only hands out slots ([`KernelAllocator`]) and ships
//! processors in and out as [`KernelCommand`]s, so the real-time thread never
//! allocates or frees one.

use crate::effect::Processor;
use crate::engine::snapshot::GraphSnapshot;
use crate::types::EffectId;
use std::collections::HashMap;

/// Arena slot plus the generation it was handed out with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelRef {
    pub index: u32,
    pub generation: u32,
}

pub enum KernelCommand {
    Install(KernelRef, Box<Processor>),
    Retire(KernelRef),
}

#[derive(Debug)]
struct Kernel {
    generation: u32,
    processor: Box<Processor>,
}

#[derive(Debug)]
pub struct KernelArena {
    slots: Vec<Option<Kernel>>,
}

impl KernelArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Fresh processors for every effect in `snapshot`, for offline renders.
    pub fn for_snapshot(snapshot: &GraphSnapshot, sample_rate: f64, capacity: usize) -> Self {
        let mut arena = Self::new(capacity);
        for fx in snapshot.nodes.iter().flat_map(|n| &n.effects) {
            arena.install(fx.kernel, Box::new(Processor::new(fx.kind, sample_rate)));
        }
        arena
    }

    /// Put `processor` in its slot. Returns whatever it displaced.
    pub fn install(&mut self, at: KernelRef, processor: Box<Processor>) -> Option<Box<Processor>> {
        let slot = self.slots.get_mut(at.index as usize)?;
        slot.replace(Kernel {
            generation: at.generation,
            processor,
        })
        .map(|k| k.processor)
    }

    /// Take the kernel out, if the slot still holds that generation.
    pub fn remove(&mut self, at: KernelRef) -> Option<Box<Processor>> {
        let slot = self.slots.get_mut(at.index as usize)?;
        if slot.as_ref().is_some_and(|k| k.generation == at.generation) {
            slot.take().map(|k| k.processor)
        } else {
            None
        }
    }

    /// `None` for an empty slot or a stale generation.
    #[inline]
    pub fn get_mut(&mut self, at: KernelRef) -> Option<&mut Processor> {
        match self.slots.get_mut(at.index as usize)? {
            Some(k) if k.generation == at.generation => Some(k.processor.as_mut()),
            _ => None,
        }
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Control-side bookkeeping of which effect owns which arena slot.
#[derive(Debug)]
pub struct KernelAllocator {
    generations: Vec<u32>,
    free: Vec<u32>,
    live: HashMap<EffectId, KernelRef>,
}

impl KernelAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            generations: vec![0; capacity],
            // pop() hands out the lowest index first
            free: (0..capacity as u32).rev().collect(),
            live: HashMap::new(),
        }
    }

    pub fn get(&self, id: EffectId) -> Option<KernelRef> {
        self.live.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Reserve a slot for `id`. `None` when the arena is full.
    pub fn allocate(&mut self, id: EffectId) -> Option<KernelRef> {
        if let Some(existing) = self.get(id) {
            return Some(existing);
        }
        let index = self.free.pop()?;
        let generation = &mut self.generations[index as usize];
        *generation = generation.wrapping_add(1);
        let at = KernelRef {
            index,
            generation: *generation,
        };
        self.live.insert(id, at);
        Some(at)
    }

    pub fn release(&mut self, id: EffectId) -> Option<KernelRef> {
        let at = self.live.remove(&id)?;
        self.free.push(at.index);
        Some(at)
    }

    /// Effects that currently hold a slot.
    pub fn effects(&self) -> Vec<EffectId> {
        let mut ids: Vec<EffectId> = self.live.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectType;

    #[test]
    fn allocator_reuses_slots_with_new_generation() {
        let mut alloc = KernelAllocator::new(2);
        let a = alloc.allocate(EffectId::from_raw(1)).unwrap();
        let b = alloc.allocate(EffectId::from_raw(2)).unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert!(alloc.allocate(EffectId::from_raw(3)).is_none());

        assert_eq!(alloc.release(EffectId::from_raw(1)), Some(a));
        let c = alloc.allocate(EffectId::from_raw(3)).unwrap();
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
    }

    #[test]
    fn stale_reference_is_ignored() {
        let mut arena = KernelArena::new(4);
        let old = KernelRef { index: 1, generation: 1 };
        let new = KernelRef { index: 1, generation: 2 };
        arena.install(old, Box::new(Processor::new(EffectType::Eq, 48000.0)));
        assert!(arena.get_mut(new).is_none());
        assert!(arena.remove(new).is_none());
        assert!(arena.get_mut(old).is_some());
        assert!(arena.remove(old).is_some());
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let mut arena = KernelArena::new(1);
        let at = KernelRef { index: 5, generation: 1 };
        assert!(arena.install(at, Box::new(Processor::new(EffectType::Gate, 48000.0))).is_none());
        assert!(arena.get_mut(at).is_none());
    }
}
