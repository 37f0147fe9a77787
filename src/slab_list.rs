//! Arena of slabs with index links.
//!
//! Slabs are stored in a vector of nodes and chained in allocation order
//! through `next`/`previous` indices. Removing a slab frees its index for
//! reuse; [`SlabId`]s of removed slabs must not be used afterwards.

use std::ptr::NonNull;

use crate::{
    error::HeapError,
    format::AllocFormat,
    header::{AllocHeader, Generation, HEADER_SIZE},
    slab::{Slab, SlabGeometry, SlabId},
    util::{align_to_word, WORD_SIZE},
    Config,
};

/// Largest payload whose size fits the header's size field.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize & !(WORD_SIZE - 1);

struct SlabNode {
    slab: Slab,
    next: Option<u32>,
    previous: Option<u32>,
}

pub struct SlabList {
    generation: Generation,
    nodes: Vec<Option<SlabNode>>,
    vacant: Vec<u32>,
    first: Option<u32>,
    last: Option<u32>,
    current: Option<u32>,
    len: usize,
    geometry: SlabGeometry,
    verbose: bool,
}

impl SlabList {
    pub fn new(generation: Generation, config: &Config) -> Self {
        Self {
            generation,
            nodes: Vec::new(),
            vacant: Vec::new(),
            first: None,
            last: None,
            current: None,
            len: 0,
            geometry: SlabGeometry::standard(config.standard_slab_cards),
            verbose: config.verbose,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Geometry of the standard slabs this list creates.
    pub fn geometry(&self) -> SlabGeometry {
        self.geometry
    }

    fn node(&self, index: u32) -> &SlabNode {
        match self.nodes.get(index as usize) {
            Some(Some(node)) => node,
            _ => panic!("slab index {} is not linked in the {:?} list", index, self.generation),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut SlabNode {
        let generation = self.generation;
        match self.nodes.get_mut(index as usize) {
            Some(Some(node)) => node,
            _ => panic!("slab index {} is not linked in the {:?} list", index, generation),
        }
    }

    fn owns(&self, id: SlabId) -> bool {
        id.generation() == self.generation
            && matches!(self.nodes.get(id.index()), Some(Some(_)))
    }

    fn id_of(&self, index: u32) -> SlabId {
        SlabId::new(self.generation, index)
    }

    /// Appends `slab`, retagging it when it comes from another generation.
    pub fn push_back(&mut self, mut slab: Slab) -> SlabId {
        if slab.generation() != self.generation {
            slab.retag(self.generation);
        }
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.nodes.push(None);
                (self.nodes.len() - 1) as u32
            }
        };
        let id = self.id_of(index);
        slab.assign_id(id);
        self.nodes[index as usize] = Some(SlabNode {
            slab,
            next: None,
            previous: self.last,
        });
        match self.last {
            Some(last) => self.node_mut(last).next = Some(index),
            None => self.first = Some(index),
        }
        self.last = Some(index);
        self.len += 1;
        id
    }

    /// Unlinks the slab named by `id` and hands it back to the caller.
    pub fn remove(&mut self, id: SlabId) -> Option<Slab> {
        if !self.owns(id) {
            return None;
        }
        let index = id.index() as u32;
        let node = self.nodes[index as usize].take()?;
        match node.previous {
            Some(previous) => self.node_mut(previous).next = node.next,
            None => self.first = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).previous = node.previous,
            None => self.last = node.previous,
        }
        if self.current == Some(index) {
            self.current = None;
        }
        self.vacant.push(index);
        self.len -= 1;
        Some(node.slab)
    }

    pub fn get(&self, id: SlabId) -> Option<&Slab> {
        if !self.owns(id) {
            return None;
        }
        self.nodes[id.index()].as_ref().map(|node| &node.slab)
    }

    pub fn get_mut(&mut self, id: SlabId) -> Option<&mut Slab> {
        if !self.owns(id) {
            return None;
        }
        self.nodes[id.index()].as_mut().map(|node| &mut node.slab)
    }

    pub fn first(&self) -> Option<SlabId> {
        self.first.map(|index| self.id_of(index))
    }

    pub fn last(&self) -> Option<SlabId> {
        self.last.map(|index| self.id_of(index))
    }

    pub fn next(&self, id: SlabId) -> Option<SlabId> {
        if !self.owns(id) {
            return None;
        }
        self.node(id.index() as u32).next.map(|index| self.id_of(index))
    }

    pub fn previous(&self, id: SlabId) -> Option<SlabId> {
        if !self.owns(id) {
            return None;
        }
        self.node(id.index() as u32)
            .previous
            .map(|index| self.id_of(index))
    }

    /// Standard slab currently used as the bump target.
    pub fn current(&self) -> Option<SlabId> {
        self.current.map(|index| self.id_of(index))
    }

    /// Slabs in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.first,
            forward: true,
        }
    }

    /// Slabs in reverse insertion order.
    pub fn iter_rev(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.last,
            forward: false,
        }
    }

    /// Maps a standard slab, appends it, and makes it the bump target.
    pub fn add_standard_slab(&mut self) -> Result<SlabId, HeapError> {
        let geometry = self.geometry;
        let slab = Slab::allocate_standard_with(geometry.total_cards(), self.generation).ok_or(
            HeapError::OutOfMemory {
                generation: self.generation,
                requested: geometry.region_size(),
            },
        )?;
        let id = self.push_back(slab);
        self.current = Some(id.index() as u32);
        logln_if!(
            self.verbose,
            generation = ?self.generation,
            slab = id.index(),
            size = geometry.region_size(),
            "added standard slab"
        );
        Ok(id)
    }

    fn add_singleton_slab(&mut self, amount: usize) -> Result<SlabId, HeapError> {
        let slab = Slab::allocate_singleton(amount, self.generation).ok_or(
            HeapError::OutOfMemory {
                generation: self.generation,
                requested: amount,
            },
        )?;
        let id = self.push_back(slab);
        logln_if!(
            self.verbose,
            generation = ?self.generation,
            slab = id.index(),
            amount,
            "added singleton slab"
        );
        Ok(id)
    }

    fn bump_current(&mut self, amount: usize, traced: bool) -> Option<(SlabId, NonNull<u8>)> {
        let index = self.current?;
        let mem = self.node_mut(index).slab.bump(amount, traced)?;
        Some((self.id_of(index), mem))
    }

    /// Allocates a header and `payload_size` payload bytes and writes the
    /// header. The payload is left uninitialized.
    ///
    /// Traced objects are placed at the head of a slab, leaf objects at the
    /// tail. When the current slab is exhausted a fresh standard slab becomes
    /// current; allocations larger than a standard slab get a singleton slab.
    pub fn create_raw(
        &mut self,
        format: AllocFormat,
        payload_size: usize,
        traced: bool,
    ) -> Result<NonNull<AllocHeader>, HeapError> {
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(HeapError::ObjectTooLarge { size: payload_size });
        }
        let payload_size = align_to_word(payload_size);
        let amount = HEADER_SIZE + payload_size;

        let (id, mem) = if amount > self.geometry.max_standard_object_size() {
            let id = self.add_singleton_slab(amount)?;
            let mem = self.bump_in(id, amount, traced)?;
            (id, mem)
        } else {
            match self.bump_current(amount, traced) {
                Some(found) => found,
                None => {
                    let id = self.add_standard_slab()?;
                    tracing::trace!(
                        target: "whisper::gc",
                        generation = ?self.generation,
                        amount,
                        "current slab exhausted"
                    );
                    let mem = self.bump_in(id, amount, traced)?;
                    (id, mem)
                }
            }
        };

        let slab = &self.node(id.index() as u32).slab;
        let card = slab.calculate_card_number(mem.as_ptr());
        let header = mem.cast::<AllocHeader>();
        unsafe {
            header.as_ptr().write(AllocHeader::new(
                format,
                self.generation,
                card,
                payload_size as u32,
            ));
        }
        Ok(header)
    }

    fn bump_in(&mut self, id: SlabId, amount: usize, traced: bool) -> Result<NonNull<u8>, HeapError> {
        let generation = self.generation;
        self.node_mut(id.index() as u32)
            .slab
            .bump(amount, traced)
            .ok_or(HeapError::OutOfMemory {
                generation,
                requested: amount,
            })
    }

    /// Moves the slab named by `id` to the back of `target`, retagging it
    /// and its objects with the target's generation. The slab never becomes
    /// the target's bump target.
    pub fn transfer(&mut self, id: SlabId, target: &mut SlabList) -> Option<SlabId> {
        let slab = self.remove(id)?;
        let new_id = target.push_back(slab);
        tracing::debug!(
            target: "whisper::gc",
            from = ?id,
            to = ?new_id,
            "transferred slab"
        );
        Some(new_id)
    }

    pub fn object_count(&self) -> usize {
        self.iter().map(|(_, slab)| slab.object_count()).sum()
    }

    pub fn used_bytes(&self) -> usize {
        self.iter().map(|(_, slab)| slab.used_bytes()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.iter().map(|(_, slab)| slab.capacity()).sum()
    }

    pub fn mapped_bytes(&self) -> usize {
        self.iter().map(|(_, slab)| slab.region_size()).sum()
    }

    pub fn singleton_count(&self) -> usize {
        self.iter().filter(|(_, slab)| slab.is_singleton()).count()
    }
}

impl std::fmt::Debug for SlabList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabList")
            .field("generation", &self.generation)
            .field("len", &self.len)
            .field("current", &self.current)
            .finish()
    }
}

pub struct Iter<'a> {
    list: &'a SlabList,
    cursor: Option<u32>,
    forward: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (SlabId, &'a Slab);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.list.node(index);
        self.cursor = if self.forward {
            node.next
        } else {
            node.previous
        };
        Some((self.list.id_of(index), &node.slab))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::CARD_SIZE;

    fn list(generation: Generation) -> SlabList {
        SlabList::new(generation, &Config::default())
    }

    fn ids(iter: Iter<'_>) -> Vec<usize> {
        iter.map(|(id, _)| id.index()).collect()
    }

    #[test]
    fn links_follow_insertion_order() {
        let mut slabs = list(Generation::Tenured);
        let a = slabs.push_back(Slab::allocate_standard(Generation::Tenured).unwrap());
        let b = slabs.push_back(Slab::allocate_standard(Generation::Tenured).unwrap());
        let c = slabs.push_back(Slab::allocate_standard(Generation::Tenured).unwrap());
        assert_eq!(slabs.len(), 3);
        assert_eq!(ids(slabs.iter()), vec![a.index(), b.index(), c.index()]);
        assert_eq!(ids(slabs.iter_rev()), vec![c.index(), b.index(), a.index()]);
        assert_eq!(slabs.next(a), Some(b));
        assert_eq!(slabs.previous(a), None);
        assert_eq!(slabs.get(b).unwrap().id(), Some(b));
        assert_eq!(slabs.current(), None);
    }

    #[test]
    fn removal_relinks_neighbours() {
        let mut slabs = list(Generation::Tenured);
        let a = slabs.push_back(Slab::allocate_standard(Generation::Tenured).unwrap());
        let b = slabs.push_back(Slab::allocate_standard(Generation::Tenured).unwrap());
        let c = slabs.push_back(Slab::allocate_standard(Generation::Tenured).unwrap());
        let removed = slabs.remove(b).unwrap();
        assert_eq!(removed.id(), Some(b));
        assert_eq!(slabs.next(a), Some(c));
        assert_eq!(slabs.previous(c), Some(a));
        assert!(slabs.get(b).is_none());
        assert!(slabs.remove(b).is_none());

        slabs.remove(a).unwrap();
        slabs.remove(c).unwrap();
        assert!(slabs.is_empty());
        assert_eq!(slabs.first(), None);
        assert_eq!(slabs.last(), None);
    }

    #[test]
    fn foreign_ids_are_rejected() {
        let mut tenured = list(Generation::Tenured);
        let id = tenured.push_back(Slab::allocate_standard(Generation::Tenured).unwrap());
        let hatchery = list(Generation::Hatchery);
        assert!(hatchery.get(id).is_none());
    }

    #[test]
    fn create_raw_places_by_traced_flag() {
        let mut slabs = list(Generation::Hatchery);
        slabs.add_standard_slab().unwrap();
        let traced = slabs.create_raw(AllocFormat::REF_ARRAY, 24, true).unwrap();
        let leaf = slabs.create_raw(AllocFormat::BLOB, 10, false).unwrap();
        let slab = slabs.get(slabs.current().unwrap()).unwrap();
        assert_eq!(traced.as_ptr() as *mut u8, slab.alloc_top());
        assert_eq!(leaf.as_ptr() as usize, slab.alloc_bottom() as usize - (HEADER_SIZE + 16));
        let header = unsafe { traced.as_ref() };
        assert_eq!(header.format(), AllocFormat::REF_ARRAY);
        assert_eq!(header.generation(), Generation::Hatchery);
        assert_eq!(header.size(), 24);
        assert_eq!(unsafe { leaf.as_ref() }.size(), 16);
    }

    #[test]
    fn exhausted_slab_falls_back_to_a_new_one() {
        let mut slabs = list(Generation::Tenured);
        let first = slabs.add_standard_slab().unwrap();
        let chunk = CARD_SIZE - HEADER_SIZE;
        while slabs.current() == Some(first) {
            slabs.create_raw(AllocFormat::BLOB, chunk, false).unwrap();
        }
        assert_eq!(slabs.len(), 2);
        let second = slabs.current().unwrap();
        assert_ne!(first, second);
        assert_eq!(slabs.get(second).unwrap().object_count(), 1);
    }

    #[test]
    fn oversized_objects_get_singletons() {
        let mut slabs = list(Generation::Tenured);
        let current = slabs.add_standard_slab().unwrap();
        let big = slabs.geometry().capacity() * 2;
        let header = slabs.create_raw(AllocFormat::BLOB, big, false).unwrap();
        assert_eq!(slabs.len(), 2);
        assert_eq!(slabs.current(), Some(current));
        assert_eq!(slabs.singleton_count(), 1);
        assert_eq!(unsafe { header.as_ref() }.size(), big);
    }

    #[test]
    fn payload_size_overflow_is_an_error() {
        let mut slabs = list(Generation::Tenured);
        assert_eq!(
            slabs.create_raw(AllocFormat::BLOB, usize::MAX, false),
            Err(HeapError::ObjectTooLarge { size: usize::MAX })
        );
    }

    #[test]
    fn transfer_retags_objects() {
        let mut hatchery = list(Generation::Hatchery);
        let mut tenured = list(Generation::Tenured);
        let id = hatchery.add_standard_slab().unwrap();
        let header = hatchery.create_raw(AllocFormat::BLOB, 8, false).unwrap();

        let moved = hatchery.transfer(id, &mut tenured).unwrap();
        assert!(hatchery.is_empty());
        assert_eq!(hatchery.current(), None);
        assert_eq!(moved.generation(), Generation::Tenured);
        assert_eq!(tenured.current(), None);
        assert_eq!(unsafe { header.as_ref() }.generation(), Generation::Tenured);
        assert_eq!(tenured.get(moved).unwrap().id(), Some(moved));
    }
}
