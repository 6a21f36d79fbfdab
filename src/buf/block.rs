//! Block Buffers
//!
//! A block buffer is an ordered list of segments, each borrowing a range of
//! a shared region. The logical byte stream is the concatenation of the
//! segments. Appending, prepending, splitting and sharing never copy
//! payload bytes; only copy-on-write does.
//!
//! Invariants: segments are non-empty, segment ranges lie within their
//! region, and the cached total equals the sum of segment lengths.

use crate::error::{Error, Result};
use crate::mem::MemAlloc;

use super::SharedMem;

/// One extent of a block buffer
#[derive(Clone)]
struct Segment {
    shared: SharedMem,
    /// Byte offset into the shared region
    offset: usize,
    /// Extent length, never 0
    len: usize,
}

/// Byte-stream payload over shared segments
#[derive(Default)]
pub struct BlockBuf {
    segs: Vec<Segment>,
    total: usize,
}

impl BlockBuf {
    /// Allocate a buffer of `size` zeroed bytes in one fresh segment
    pub fn alloc(alloc: &dyn MemAlloc, size: usize) -> Result<Self> {
        if size == 0 {
            return Ok(Self::default());
        }
        let mem = alloc.alloc(size)?;
        Ok(Self {
            segs: vec![Segment {
                shared: SharedMem::new(mem),
                offset: 0,
                len: size,
            }],
            total: size,
        })
    }

    /// Allocate a buffer holding a copy of `data`
    pub fn from_slice(alloc: &dyn MemAlloc, data: &[u8]) -> Result<Self> {
        let mut buf = Self::alloc(alloc, data.len())?;
        if !data.is_empty() {
            let mut size = data.len();
            buf.write(0, &mut size)?.copy_from_slice(data);
        }
        Ok(buf)
    }

    /// Total size of the byte stream
    pub fn size(&self) -> usize {
        self.total
    }

    /// Whether the stream is empty
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Locate the segment containing `offset`; returns (index, offset within
    /// segment)
    fn locate(&self, offset: usize) -> Result<(usize, usize)> {
        if offset >= self.total {
            return Err(Error::Invalid);
        }
        let mut base = 0;
        for (i, seg) in self.segs.iter().enumerate() {
            if offset < base + seg.len {
                return Ok((i, offset - base));
            }
            base += seg.len;
        }
        Err(Error::Invalid)
    }

    /// Read access to the largest contiguous run at `offset`
    ///
    /// On input `*size` is the wanted byte count (`usize::MAX` for "to the
    /// end"); on output it is the length of the returned slice, which never
    /// exceeds the want and never is 0 for an in-range request. Callers loop
    /// until they have consumed what they need. Reading is always allowed,
    /// shared or not.
    pub fn read(&self, offset: usize, size: &mut usize) -> Result<&[u8]> {
        let want = *size;
        if want == 0 {
            return Err(Error::Invalid);
        }
        let (i, in_off) = self.locate(offset)?;
        let seg = &self.segs[i];
        let run = (seg.len - in_off).min(want);
        *size = run;
        Ok(&seg.shared.as_slice()[seg.offset + in_off..seg.offset + in_off + run])
    }

    /// Writable access to the largest contiguous run at `offset`
    ///
    /// Same contract as [`read`](Self::read), but fails with `Busy` when the
    /// covering segment's region is shared. Use
    /// [`make_writable`](Self::make_writable) to copy-on-write first.
    pub fn write(&mut self, offset: usize, size: &mut usize) -> Result<&mut [u8]> {
        let want = *size;
        if want == 0 {
            return Err(Error::Invalid);
        }
        let (i, in_off) = self.locate(offset)?;
        let seg = &mut self.segs[i];
        let run = (seg.len - in_off).min(want);
        let range = seg.offset + in_off..seg.offset + in_off + run;
        let slice = seg.shared.try_mut()?;
        *size = run;
        Ok(&mut slice[range])
    }

    /// Copy-on-write every shared segment intersecting `[offset, offset+size)`
    pub fn make_writable(
        &mut self,
        alloc: &dyn MemAlloc,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = offset.checked_add(size).ok_or(Error::Invalid)?;
        if end > self.total {
            return Err(Error::Invalid);
        }
        let mut base = 0;
        for seg in &mut self.segs {
            let seg_end = base + seg.len;
            if seg_end > offset && base < end && seg.shared.is_shared() {
                let mut mem = alloc.alloc(seg.len)?;
                mem.as_mut_slice()
                    .copy_from_slice(&seg.shared.as_slice()[seg.offset..seg.offset + seg.len]);
                seg.shared = SharedMem::new(mem);
                seg.offset = 0;
            }
            base = seg_end;
        }
        Ok(())
    }

    /// Append another buffer; O(1), no payload copy, `tail` is consumed
    pub fn append(&mut self, tail: BlockBuf) {
        self.total += tail.total;
        self.segs.extend(tail.segs);
    }

    /// Prepend another buffer; O(number of segments), no payload copy
    pub fn prepend(&mut self, head: BlockBuf) {
        self.total += head.total;
        let mut segs = head.segs;
        segs.append(&mut self.segs);
        self.segs = segs;
    }

    /// Drop `skip` bytes from the front, then cut the stream to `new_size`
    /// bytes (`None` keeps everything remaining)
    ///
    /// A negative `skip` prepends `-skip` zeroed bytes in a fresh segment.
    pub fn resize(
        &mut self,
        alloc: &dyn MemAlloc,
        skip: isize,
        new_size: Option<usize>,
    ) -> Result<()> {
        if skip > 0 {
            self.drop_front(skip as usize)?;
        } else if skip < 0 {
            let pad = BlockBuf::alloc(alloc, skip.unsigned_abs())?;
            self.prepend(pad);
        }
        if let Some(new_size) = new_size {
            if new_size > self.total {
                return Err(Error::Invalid);
            }
            self.truncate(new_size);
        }
        Ok(())
    }

    /// Drop `n` bytes from the front without touching storage
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.drop_front(n)
    }

    fn drop_front(&mut self, mut skip: usize) -> Result<()> {
        if skip > self.total {
            return Err(Error::Invalid);
        }
        self.total -= skip;
        while skip > 0 {
            let seg = &mut self.segs[0];
            if skip >= seg.len {
                skip -= seg.len;
                self.segs.remove(0);
            } else {
                seg.offset += skip;
                seg.len -= skip;
                skip = 0;
            }
        }
        Ok(())
    }

    /// Cut the stream to at most `size` bytes
    pub fn truncate(&mut self, size: usize) {
        if size >= self.total {
            return;
        }
        let mut keep = size;
        let mut last = 0;
        for (i, seg) in self.segs.iter_mut().enumerate() {
            if keep == 0 {
                break;
            }
            if keep < seg.len {
                seg.len = keep;
            }
            keep = keep.saturating_sub(seg.len);
            last = i;
        }
        if size == 0 {
            self.segs.clear();
        } else {
            self.segs.truncate(last + 1);
        }
        self.total = size;
    }

    /// Produce a buffer sharing `[offset, offset+size)` of this stream
    pub fn splice(&self, offset: usize, size: usize) -> Result<BlockBuf> {
        if size == 0 {
            return Ok(BlockBuf::default());
        }
        let end = offset.checked_add(size).ok_or(Error::Invalid)?;
        if end > self.total {
            return Err(Error::Invalid);
        }
        let mut out = BlockBuf::default();
        let mut base = 0;
        for seg in &self.segs {
            let seg_end = base + seg.len;
            if seg_end > offset && base < end {
                let from = offset.max(base) - base;
                let to = end.min(seg_end) - base;
                out.segs.push(Segment {
                    shared: seg.shared.clone(),
                    offset: seg.offset + from,
                    len: to - from,
                });
                out.total += to - from;
            }
            base = seg_end;
        }
        Ok(out)
    }

    /// Split the buffer at `at`; self keeps `[0, at)`, the tail is returned
    pub fn split_off(&mut self, at: usize) -> Result<BlockBuf> {
        let tail = self.splice(at, self.total - at)?;
        self.truncate(at);
        Ok(tail)
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`
    pub fn extract(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let mut run = out.len() - done;
            let slice = self.read(offset + done, &mut run)?;
            out[done..done + run].copy_from_slice(slice);
            done += run;
        }
        Ok(())
    }

    /// Borrow `[offset, offset + scratch.len())` contiguously
    ///
    /// Returns an in-place slice when the range lies in one segment,
    /// otherwise gathers into `scratch` and returns that.
    pub fn peek<'a>(&'a self, offset: usize, scratch: &'a mut [u8]) -> Result<&'a [u8]> {
        let mut run = scratch.len();
        if run == 0 {
            return Err(Error::Invalid);
        }
        let slice = self.read(offset, &mut run)?;
        if run == scratch.len() {
            return Ok(slice);
        }
        self.extract(offset, scratch)?;
        Ok(scratch)
    }

    /// Share the whole stream (refcount clone of every segment)
    pub fn dup(&self) -> BlockBuf {
        BlockBuf {
            segs: self.segs.clone(),
            total: self.total,
        }
    }

    /// Copy the whole stream out
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total];
        if self.total > 0 {
            self.extract(0, &mut out).expect("in range");
        }
        out
    }

    /// Number of segments (diagnostic)
    pub fn segments(&self) -> usize {
        self.segs.len()
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        assert_eq!(self.total, self.segs.iter().map(|s| s.len).sum::<usize>());
        assert!(self.segs.iter().all(|s| s.len > 0));
        assert!(self
            .segs
            .iter()
            .all(|s| s.offset + s.len <= s.shared.len()));
    }
}

impl std::fmt::Debug for BlockBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(debug_assertions)]
        self.check_invariants();
        f.debug_struct("BlockBuf")
            .field("size", &self.total)
            .field("segments", &self.segs.len())
            .finish()
    }
}
