use std::mem::size_of;

/// Machine word size. Every heap and bump allocation is rounded to it.
pub const WORD_SIZE: usize = size_of::<usize>();

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Rounds `size` up to whole machine words.
#[inline(always)]
pub const fn align_to_word(size: usize) -> usize {
    align_up(size, WORD_SIZE)
}

/// Number of `unit`-sized pieces needed to hold `size` bytes.
#[inline(always)]
pub const fn div_ceil(size: usize, unit: usize) -> usize {
    (size + unit - 1) / unit
}

/// Human readable byte count used by statistics and log lines.
pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
