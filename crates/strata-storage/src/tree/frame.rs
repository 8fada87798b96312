//! Node frame: typed access to one tree page
//!
//! Layout, shared by leaf and interior pages (little endian):
//!
//! ```text
//! +-------+-------+-------+---------+-------+-------+-----------+
//! | level |  lsn  |  nsn  |  right  | flags | count | free off  |
//! |  u8   |  u64  |  u64  |   i32   |  u8   |  u16  |    u32    |
//! +-------+-------+-------+---------+-------+-------+-----------+
//! 0       1       9       17        21      22      24          28
//!
//! | header | tuple images --->            free            <--- slots |
//! ```
//!
//! A tuple image is the encoded tuple followed by a `u16` length trailer.
//! Slot `i` is a `u32` holding the end offset of image `i`; slot 0 sits in
//! the last four bytes of the page and the directory grows downward.

use strata_common::{Error, PageId, Result, Tuple};

pub const LEVEL_OFFSET: usize = 0;
pub const LSN_OFFSET: usize = 1;
pub const NSN_OFFSET: usize = 9;
pub const RIGHT_SIBLING_OFFSET: usize = 17;
pub const FLAGS_OFFSET: usize = 21;
pub const TUPLE_COUNT_OFFSET: usize = 22;
pub const FREE_SPACE_OFFSET: usize = 24;
pub const HEADER_SIZE: usize = 28;
pub const SLOT_SIZE: usize = 4;

const TRAILER_SIZE: usize = 2;
const NO_SIBLING: i32 = -1;
const FLAG_FOLLOW_RIGHT: u8 = 0x01;

/// Whether an image of a given size fits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceStatus {
    Sufficient,
    SufficientAfterCompaction,
    Insufficient,
}

/// Bytes a tuple of `encoded_len` consumes in a page, slot included
#[must_use]
pub const fn footprint(encoded_len: usize) -> usize {
    encoded_len + TRAILER_SIZE + SLOT_SIZE
}

/// Largest encoded tuple a page of `page_size` accepts
#[must_use]
pub const fn max_tuple_size(page_size: usize) -> usize {
    (page_size - HEADER_SIZE) / 4 - TRAILER_SIZE - SLOT_SIZE
}

/// Usable bytes of a page
#[must_use]
pub const fn capacity(page_size: usize) -> usize {
    page_size - HEADER_SIZE
}

/// View over a latched page buffer
pub struct NodeFrame<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> NodeFrame<B> {
    pub const fn new(buf: B) -> Self {
        Self { buf }
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn read_u16(&self, at: usize) -> u16 {
        let b = self.bytes();
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    fn read_u32(&self, at: usize) -> u32 {
        let b = self.bytes();
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    fn read_u64(&self, at: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[at..at + 8]);
        u64::from_le_bytes(raw)
    }

    pub fn level(&self) -> u8 {
        self.bytes()[LEVEL_OFFSET]
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn lsn(&self) -> u64 {
        self.read_u64(LSN_OFFSET)
    }

    pub fn nsn(&self) -> u64 {
        self.read_u64(NSN_OFFSET)
    }

    /// Set while a split of this page has not yet been posted to its parent
    pub fn follows_right(&self) -> bool {
        self.bytes()[FLAGS_OFFSET] & FLAG_FOLLOW_RIGHT != 0
    }

    pub fn right_sibling(&self) -> Option<PageId> {
        let raw = self.read_u32(RIGHT_SIBLING_OFFSET).cast_signed();
        (raw != NO_SIBLING).then(|| PageId::new(raw.cast_unsigned()))
    }

    pub fn tuple_count(&self) -> usize {
        usize::from(self.read_u16(TUPLE_COUNT_OFFSET))
    }

    fn free_space_offset(&self) -> usize {
        self.read_u32(FREE_SPACE_OFFSET) as usize
    }

    /// Start of the slot directory. Fails if the stored count does not fit
    /// the page.
    fn directory_start(&self) -> Result<usize> {
        let count = self.tuple_count();
        let len = self.bytes().len();
        SLOT_SIZE
            .checked_mul(count)
            .and_then(|size| len.checked_sub(size))
            .filter(|start| *start >= self.free_space_offset().max(HEADER_SIZE))
            .ok_or_else(|| Error::corruption(format!("{count} slots do not fit a {len}-byte page")))
    }

    fn slot_offset(&self, slot: usize) -> usize {
        self.bytes().len() - SLOT_SIZE * (slot + 1)
    }

    fn tuple_end(&self, slot: usize) -> usize {
        self.read_u32(self.slot_offset(slot)) as usize
    }

    /// Encoded image of the tuple at `slot`
    pub fn tuple_bytes(&self, slot: usize) -> Result<&[u8]> {
        self.directory_start()?;
        if slot >= self.tuple_count() {
            return Err(Error::corruption(format!(
                "slot {slot} beyond {} tuples",
                self.tuple_count()
            )));
        }
        let end = self.tuple_end(slot);
        if end < HEADER_SIZE + TRAILER_SIZE || end > self.free_space_offset() {
            return Err(Error::corruption(format!("slot {slot} points at {end}")));
        }
        let len = usize::from(self.read_u16(end - TRAILER_SIZE));
        let start = (end - TRAILER_SIZE)
            .checked_sub(len)
            .filter(|s| *s >= HEADER_SIZE)
            .ok_or_else(|| Error::corruption(format!("slot {slot} has bad length {len}")))?;
        Ok(&self.bytes()[start..end - TRAILER_SIZE])
    }

    pub fn tuple(&self, slot: usize) -> Result<Tuple> {
        Tuple::decode(self.tuple_bytes(slot)?)
    }

    pub fn tuples(&self) -> Result<Vec<Tuple>> {
        (0..self.tuple_count()).map(|i| self.tuple(i)).collect()
    }

    /// Encoded images of every tuple, in slot order
    pub fn images(&self) -> Result<Vec<Vec<u8>>> {
        (0..self.tuple_count())
            .map(|i| self.tuple_bytes(i).map(<[u8]>::to_vec))
            .collect()
    }

    fn live_bytes(&self) -> Result<usize> {
        (0..self.tuple_count())
            .map(|i| self.tuple_bytes(i).map(|b| b.len() + TRAILER_SIZE))
            .sum()
    }

    /// Free bytes between the tuple heap and the slot directory
    pub fn contiguous_free(&self) -> usize {
        let slots_start = self.bytes().len().saturating_sub(SLOT_SIZE * self.tuple_count());
        slots_start.saturating_sub(self.free_space_offset())
    }

    /// Check whether an image of `encoded_len` bytes can be added
    pub fn has_space(&self, encoded_len: usize, max_entries: Option<usize>) -> Result<SpaceStatus> {
        self.directory_start()?;
        if max_entries.is_some_and(|max| self.tuple_count() >= max) {
            return Ok(SpaceStatus::Insufficient);
        }
        let needed = footprint(encoded_len);
        if needed <= self.contiguous_free() {
            return Ok(SpaceStatus::Sufficient);
        }
        let used = self.live_bytes()? + SLOT_SIZE * self.tuple_count();
        if used + needed <= capacity(self.bytes().len()) {
            Ok(SpaceStatus::SufficientAfterCompaction)
        } else {
            Ok(SpaceStatus::Insufficient)
        }
    }

    /// Slot holding the interior entry that points at `child`
    pub fn find_child_slot(&self, child: PageId, child_field: usize) -> Result<Option<usize>> {
        for slot in 0..self.tuple_count() {
            let tuple = self.tuple(slot)?;
            if tuple.field(child_field).and_then(strata_common::Field::as_i64)
                == Some(i64::from(child.as_u32()))
            {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NodeFrame<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn write_u16(&mut self, at: usize, value: u16) {
        self.bytes_mut()[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.bytes_mut()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, at: usize, value: u64) {
        self.bytes_mut()[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Reset the page to an empty node at `level`
    pub fn init(&mut self, level: u8) {
        self.bytes_mut()[..HEADER_SIZE].fill(0);
        self.bytes_mut()[LEVEL_OFFSET] = level;
        self.write_u32(RIGHT_SIBLING_OFFSET, NO_SIBLING.cast_unsigned());
        self.write_u32(FREE_SPACE_OFFSET, HEADER_SIZE as u32);
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.write_u64(LSN_OFFSET, lsn);
    }

    pub fn set_nsn(&mut self, nsn: u64) {
        self.write_u64(NSN_OFFSET, nsn);
    }

    pub fn set_follows_right(&mut self, on: bool) {
        let flags = &mut self.bytes_mut()[FLAGS_OFFSET];
        if on {
            *flags |= FLAG_FOLLOW_RIGHT;
        } else {
            *flags &= !FLAG_FOLLOW_RIGHT;
        }
    }

    pub fn set_right_sibling(&mut self, right: Option<PageId>) {
        let raw = right.map_or(NO_SIBLING, |p| p.as_u32().cast_signed());
        self.write_u32(RIGHT_SIBLING_OFFSET, raw.cast_unsigned());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_tuple_count(&mut self, count: usize) {
        self.write_u16(TUPLE_COUNT_OFFSET, count as u16);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_free_space_offset(&mut self, offset: usize) {
        self.write_u32(FREE_SPACE_OFFSET, offset as u32);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_tuple_end(&mut self, slot: usize, end: usize) {
        let at = self.slot_offset(slot);
        self.write_u32(at, end as u32);
    }

    /// Insert an image at `slot`, shifting later slots up. The caller has
    /// checked space (and compacted if needed).
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert_at(&mut self, slot: usize, image: &[u8]) -> Result<()> {
        let count = self.tuple_count();
        if slot > count {
            return Err(Error::internal(format!("insert slot {slot} beyond {count}")));
        }
        self.directory_start()?;
        if footprint(image.len()) > self.contiguous_free() {
            return Err(Error::internal("insert without contiguous free space"));
        }
        let start = self.free_space_offset();
        let end = start + image.len() + TRAILER_SIZE;
        self.bytes_mut()[start..start + image.len()].copy_from_slice(image);
        self.write_u16(start + image.len(), image.len() as u16);

        // Slot i lives at page_end - 4(i+1): shifting slots up moves the
        // directory one entry toward the heap.
        let len = self.bytes().len();
        let dir_start = self.directory_start()?;
        let at = len - SLOT_SIZE * slot;
        self.bytes_mut()
            .copy_within(dir_start..at, dir_start - SLOT_SIZE);
        self.set_tuple_count(count + 1);
        self.set_tuple_end(slot, end);
        self.set_free_space_offset(end);
        Ok(())
    }

    pub fn append(&mut self, image: &[u8]) -> Result<()> {
        self.insert_at(self.tuple_count(), image)
    }

    /// Remove the slot; the image bytes stay behind until compaction
    pub fn delete(&mut self, slot: usize) -> Result<()> {
        let count = self.tuple_count();
        if slot >= count {
            return Err(Error::internal(format!("delete slot {slot} beyond {count}")));
        }
        let len = self.bytes().len();
        let dir_start = self.directory_start()?;
        let at = len - SLOT_SIZE * (slot + 1);
        self.bytes_mut()
            .copy_within(dir_start..at, dir_start + SLOT_SIZE);
        self.set_tuple_count(count - 1);
        Ok(())
    }

    /// Overwrite the image at `slot`. Same-size images are replaced in
    /// place; others are re-inserted at the same slot. Returns false and
    /// leaves the page untouched if the new image does not fit.
    pub fn replace(&mut self, slot: usize, image: &[u8]) -> Result<bool> {
        let current = self.tuple_bytes(slot)?.len();
        if current == image.len() {
            let end = self.tuple_end(slot);
            let start = end - TRAILER_SIZE - current;
            self.bytes_mut()[start..start + current].copy_from_slice(image);
            return Ok(true);
        }
        // Dropping the old slot frees one directory entry
        let needed = footprint(image.len());
        let compact = if needed <= self.contiguous_free() + SLOT_SIZE {
            false
        } else {
            let used = self.live_bytes()? + SLOT_SIZE * self.tuple_count();
            if used - footprint(current) + needed > capacity(self.bytes().len()) {
                return Ok(false);
            }
            true
        };
        self.delete(slot)?;
        if compact {
            self.compact()?;
        }
        self.insert_at(slot, image)?;
        Ok(true)
    }

    /// Rewrite the tuple heap without holes, preserving slot order
    pub fn compact(&mut self) -> Result<()> {
        let images = self.images()?;
        let level = self.level();
        let (lsn, nsn) = (self.lsn(), self.nsn());
        let right = self.right_sibling();
        let follows = self.follows_right();
        self.init(level);
        self.set_lsn(lsn);
        self.set_nsn(nsn);
        self.set_right_sibling(right);
        self.set_follows_right(follows);
        for image in &images {
            self.append(image)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        let mut buf = vec![0xAAu8; 256];
        NodeFrame::new(&mut buf[..]).init(0);
        buf
    }

    #[test]
    fn test_header_layout() {
        let mut buf = page();
        {
            let mut frame = NodeFrame::new(&mut buf[..]);
            frame.init(3);
            frame.set_lsn(0x0102_0304_0506_0708);
            frame.set_nsn(42);
            frame.set_right_sibling(Some(PageId::new(9)));
            frame.set_follows_right(true);
        }
        assert_eq!(buf[0], 3);
        assert_eq!(&buf[1..9], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&buf[9..17], &42u64.to_le_bytes());
        assert_eq!(&buf[17..21], &9i32.to_le_bytes());
        assert_eq!(buf[21], 1);
        assert_eq!(&buf[22..24], &0u16.to_le_bytes());
        assert_eq!(&buf[24..28], &28u32.to_le_bytes());

        let mut frame = NodeFrame::new(&mut buf[..]);
        frame.set_right_sibling(None);
        assert_eq!(frame.right_sibling(), None);
        assert!(!frame.is_leaf());
        assert!(frame.follows_right());
    }

    #[test]
    fn test_slots_hold_tuple_end_offsets() {
        let mut buf = page();
        let image = Tuple::ints(&[5]).encode();
        NodeFrame::new(&mut buf[..]).append(&image).unwrap();

        let end = HEADER_SIZE + image.len() + 2;
        assert_eq!(&buf[252..256], &(end as u32).to_le_bytes());
        assert_eq!(&buf[end - 2..end], &(image.len() as u16).to_le_bytes());
    }

    #[test]
    fn test_insert_keeps_slot_order() {
        let mut buf = page();
        let mut frame = NodeFrame::new(&mut buf[..]);
        frame.append(&Tuple::ints(&[1]).encode()).unwrap();
        frame.append(&Tuple::ints(&[3]).encode()).unwrap();
        frame.insert_at(1, &Tuple::ints(&[2]).encode()).unwrap();
        frame.insert_at(0, &Tuple::ints(&[0]).encode()).unwrap();

        let values: Vec<Tuple> = frame.tuples().unwrap();
        assert_eq!(
            values,
            vec![Tuple::ints(&[0]), Tuple::ints(&[1]), Tuple::ints(&[2]), Tuple::ints(&[3])]
        );

        frame.delete(1).unwrap();
        assert_eq!(frame.tuple(1).unwrap(), Tuple::ints(&[2]));
        assert_eq!(frame.tuple_count(), 3);
    }

    #[test]
    fn test_space_status_and_compaction() {
        let mut buf = page();
        let mut frame = NodeFrame::new(&mut buf[..]);
        let image = Tuple::ints(&[7, 7]).encode();
        let per_tuple = footprint(image.len());
        let fits = capacity(256) / per_tuple;

        for _ in 0..fits {
            assert_eq!(frame.has_space(image.len(), None).unwrap(), SpaceStatus::Sufficient);
            frame.append(&image).unwrap();
        }
        assert_eq!(frame.has_space(image.len(), None).unwrap(), SpaceStatus::Insufficient);

        frame.delete(0).unwrap();
        assert_eq!(
            frame.has_space(image.len(), None).unwrap(),
            SpaceStatus::SufficientAfterCompaction
        );
        frame.compact().unwrap();
        assert_eq!(frame.has_space(image.len(), None).unwrap(), SpaceStatus::Sufficient);
        assert_eq!(frame.tuple_count(), fits - 1);
    }

    #[test]
    fn test_entry_cap() {
        let mut buf = page();
        let mut frame = NodeFrame::new(&mut buf[..]);
        for i in 0..3 {
            frame.append(&Tuple::ints(&[i]).encode()).unwrap();
        }
        assert_eq!(frame.has_space(4, Some(3)).unwrap(), SpaceStatus::Insufficient);
        assert_eq!(frame.has_space(4, Some(4)).unwrap(), SpaceStatus::Sufficient);
    }

    #[test]
    fn test_replace_and_find_child() {
        let mut buf = page();
        let mut frame = NodeFrame::new(&mut buf[..]);
        frame.append(&Tuple::ints(&[10, 20, 4]).encode()).unwrap();
        frame.append(&Tuple::ints(&[30, 40, 5]).encode()).unwrap();

        assert_eq!(frame.find_child_slot(PageId::new(5), 2).unwrap(), Some(1));
        assert_eq!(frame.find_child_slot(PageId::new(6), 2).unwrap(), None);

        assert!(frame.replace(1, &Tuple::ints(&[25, 40, 5]).encode()).unwrap());
        assert_eq!(frame.tuple(1).unwrap(), Tuple::ints(&[25, 40, 5]));

        assert!(frame.replace(0, &Tuple::ints(&[1]).encode()).unwrap());
        assert_eq!(frame.tuple(0).unwrap(), Tuple::ints(&[1]));
        assert_eq!(frame.tuple_count(), 2);
    }

    #[test]
    fn test_replace_that_does_not_fit_keeps_the_page() {
        let mut buf = page();
        let mut frame = NodeFrame::new(&mut buf[..]);
        let image = Tuple::ints(&[7]).encode();
        while frame.has_space(image.len(), None).unwrap() != SpaceStatus::Insufficient {
            frame.append(&image).unwrap();
        }
        let count = frame.tuple_count();

        let wider = Tuple::ints(&[1, 2, 3, 4]).encode();
        assert!(!frame.replace(0, &wider).unwrap());
        assert_eq!(frame.tuple_count(), count);
        assert_eq!(frame.tuples().unwrap(), vec![Tuple::ints(&[7]); count]);

        // Room left by a delete is reclaimed through compaction
        frame.delete(count - 1).unwrap();
        frame.delete(count - 2).unwrap();
        assert!(frame.replace(0, &wider).unwrap());
        assert_eq!(frame.tuple(0).unwrap(), Tuple::ints(&[1, 2, 3, 4]));
        assert_eq!(frame.tuple_count(), count - 2);
    }

    #[test]
    fn test_corrupt_tuple_count_is_reported() {
        let mut buf = page();
        {
            let mut frame = NodeFrame::new(&mut buf[..]);
            frame.append(&Tuple::ints(&[1]).encode()).unwrap();
            frame.append(&Tuple::ints(&[2]).encode()).unwrap();
        }
        buf[TUPLE_COUNT_OFFSET..TUPLE_COUNT_OFFSET + 2].copy_from_slice(&u16::MAX.to_le_bytes());

        let mut frame = NodeFrame::new(&mut buf[..]);
        assert!(matches!(frame.tuple_bytes(0), Err(Error::Corruption(_))));
        assert!(matches!(frame.tuples(), Err(Error::Corruption(_))));
        assert!(matches!(frame.has_space(4, None), Err(Error::Corruption(_))));
        assert!(matches!(frame.delete(0), Err(Error::Corruption(_))));
        assert!(matches!(frame.append(&[0; 4]), Err(Error::Corruption(_))));
        assert_eq!(frame.contiguous_free(), 0);
    }

    #[test]
    fn test_max_tuple_size_leaves_room_for_four() {
        let size = max_tuple_size(4096);
        assert!(4 * footprint(size) <= capacity(4096));
    }
}
