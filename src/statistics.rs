use crate::{header::Generation, slab_list::SlabList, util::formatted_size};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GenerationStatistics {
    pub slabs: usize,
    pub singleton_slabs: usize,
    pub mapped_bytes: usize,
    pub capacity_bytes: usize,
    pub used_bytes: usize,
    pub objects: usize,
}

impl GenerationStatistics {
    pub fn of(list: &SlabList) -> Self {
        Self {
            slabs: list.len(),
            singleton_slabs: list.singleton_count(),
            mapped_bytes: list.mapped_bytes(),
            capacity_bytes: list.capacity(),
            used_bytes: list.used_bytes(),
            objects: list.object_count(),
        }
    }
}

/// Snapshot of one thread's view of the heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Indexed by `Generation as usize`.
    pub generations: [GenerationStatistics; 4],
    pub locals: usize,
    pub threads: usize,
}

impl HeapStatistics {
    pub fn generation(&self, generation: Generation) -> &GenerationStatistics {
        &self.generations[generation as usize]
    }

    pub fn total_mapped_bytes(&self) -> usize {
        self.generations.iter().map(|g| g.mapped_bytes).sum()
    }

    pub fn total_objects(&self) -> usize {
        self.generations.iter().map(|g| g.objects).sum()
    }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        for generation in Generation::ALL {
            let stats = self.generation(generation);
            writeln!(
                f,
                "  {:?}: {} slabs ({} singleton), {} used of {} ({} mapped), {} objects",
                generation,
                stats.slabs,
                stats.singleton_slabs,
                formatted_size(stats.used_bytes),
                formatted_size(stats.capacity_bytes),
                formatted_size(stats.mapped_bytes),
                stats.objects
            )?;
        }
        writeln!(
            f,
            "  Total memory mapped: {}",
            formatted_size(self.total_mapped_bytes())
        )?;
        writeln!(f, "  Live locals: {}", self.locals)?;
        writeln!(f, "  Registered threads: {}", self.threads)?;
        Ok(())
    }
}
