//! Payload Buffers
//!
//! A [`Buf`] is the payload slot of a packet. Four kinds exist:
//!
//! - **block**: a logical byte stream over a list of shared segments,
//!   supporting O(1) append/prepend/split without copying;
//! - **picture**: a set of chroma planes with subsampling and stride;
//! - **sound**: planar or interleaved audio samples;
//! - **void**: no payload, attributes only.
//!
//! Storage is shared by reference ([`SharedMem`]); sharing makes a region
//! read-only. Writable access goes through uniqueness-checked mutable
//! borrows and fails with [`Error::Busy`](crate::error::Error::Busy) when
//! the region is shared, at which point callers copy-on-write.

mod block;
mod pic;
mod sound;

pub use block::BlockBuf;
pub use pic::{PicBuf, PicFormat, PlaneDesc};
pub use sound::SoundBuf;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mem::{Mem, MemAlloc};

/// Reference-counted backing region
///
/// Cloning shares the bytes. Writable access requires the clone count to be
/// exactly one; see [`SharedMem::try_mut`].
#[derive(Clone)]
pub struct SharedMem(Arc<Mem>);

impl SharedMem {
    /// Wrap an owned region
    pub fn new(mem: Mem) -> Self {
        Self(Arc::new(mem))
    }

    /// Region length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read access; always allowed
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Mutable access, only while this is the sole reference
    pub fn try_mut(&mut self) -> Result<&mut [u8]> {
        match Arc::get_mut(&mut self.0) {
            Some(mem) => Ok(mem.as_mut_slice()),
            None => Err(Error::Busy),
        }
    }

    /// Whether another clone of this region exists
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }
}

impl std::fmt::Debug for SharedMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMem")
            .field("len", &self.len())
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// A packet payload
#[derive(Debug)]
pub enum Buf {
    /// Byte-stream payload
    Block(BlockBuf),
    /// Picture payload
    Pic(PicBuf),
    /// Sound payload
    Sound(SoundBuf),
    /// No payload
    Void,
}

impl Buf {
    /// Share the payload; block/picture/sound storage is refcount-cloned
    pub fn dup(&self) -> Buf {
        match self {
            Buf::Block(b) => Buf::Block(b.dup()),
            Buf::Pic(p) => Buf::Pic(p.dup()),
            Buf::Sound(s) => Buf::Sound(s.dup()),
            Buf::Void => Buf::Void,
        }
    }

    /// Borrow as a block buffer
    pub fn as_block(&self) -> Result<&BlockBuf> {
        match self {
            Buf::Block(b) => Ok(b),
            _ => Err(Error::Invalid),
        }
    }

    /// Mutably borrow as a block buffer
    pub fn as_block_mut(&mut self) -> Result<&mut BlockBuf> {
        match self {
            Buf::Block(b) => Ok(b),
            _ => Err(Error::Invalid),
        }
    }

    /// Borrow as a picture buffer
    pub fn as_pic(&self) -> Result<&PicBuf> {
        match self {
            Buf::Pic(p) => Ok(p),
            _ => Err(Error::Invalid),
        }
    }

    /// Mutably borrow as a picture buffer
    pub fn as_pic_mut(&mut self) -> Result<&mut PicBuf> {
        match self {
            Buf::Pic(p) => Ok(p),
            _ => Err(Error::Invalid),
        }
    }

    /// Borrow as a sound buffer
    pub fn as_sound(&self) -> Result<&SoundBuf> {
        match self {
            Buf::Sound(s) => Ok(s),
            _ => Err(Error::Invalid),
        }
    }

    /// Mutably borrow as a sound buffer
    pub fn as_sound_mut(&mut self) -> Result<&mut SoundBuf> {
        match self {
            Buf::Sound(s) => Ok(s),
            _ => Err(Error::Invalid),
        }
    }
}

enum BufMgrKind {
    Block,
    Pic {
        format: Arc<PicFormat>,
        align: usize,
    },
    Sound {
        plane_names: Vec<&'static str>,
        frame_size: usize,
    },
}

struct BufMgrInner {
    mem: Arc<dyn MemAlloc>,
    kind: BufMgrKind,
}

/// A buffer allocator conforming to one flow format
///
/// Pipes do not allocate one themselves: they register a request carrying
/// the flow format they need, and a provider (typically the application's
/// probe at the top of the chain) synthesizes a matching manager, picking
/// memory backing, picture geometry and alignment.
#[derive(Clone)]
pub struct BufMgr {
    inner: Arc<BufMgrInner>,
}

impl BufMgr {
    /// Manager for block flows
    pub fn block(mem: Arc<dyn MemAlloc>) -> Self {
        Self {
            inner: Arc::new(BufMgrInner {
                mem,
                kind: BufMgrKind::Block,
            }),
        }
    }

    /// Manager for picture flows with the given format and alignment
    pub fn pic(mem: Arc<dyn MemAlloc>, format: Arc<PicFormat>, align: usize) -> Self {
        Self {
            inner: Arc::new(BufMgrInner {
                mem,
                kind: BufMgrKind::Pic { format, align },
            }),
        }
    }

    /// Manager for sound flows
    pub fn sound(mem: Arc<dyn MemAlloc>, plane_names: Vec<&'static str>, frame_size: usize) -> Self {
        Self {
            inner: Arc::new(BufMgrInner {
                mem,
                kind: BufMgrKind::Sound {
                    plane_names,
                    frame_size,
                },
            }),
        }
    }

    /// The memory backing
    pub fn mem(&self) -> &Arc<dyn MemAlloc> {
        &self.inner.mem
    }

    /// Allocate a block buffer; fails on non-block managers
    pub fn alloc_block(&self, size: usize) -> Result<BlockBuf> {
        match self.inner.kind {
            BufMgrKind::Block => BlockBuf::alloc(self.inner.mem.as_ref(), size),
            _ => Err(Error::Invalid),
        }
    }

    /// Allocate a block buffer holding a copy of `data`
    pub fn block_from_slice(&self, data: &[u8]) -> Result<BlockBuf> {
        match self.inner.kind {
            BufMgrKind::Block => BlockBuf::from_slice(self.inner.mem.as_ref(), data),
            _ => Err(Error::Invalid),
        }
    }

    /// Allocate a picture; fails on non-picture managers
    pub fn alloc_pic(&self, hsize: usize, vsize: usize) -> Result<PicBuf> {
        match &self.inner.kind {
            BufMgrKind::Pic { format, align } => {
                PicBuf::alloc(self.inner.mem.as_ref(), format, hsize, vsize, *align)
            }
            _ => Err(Error::Invalid),
        }
    }

    /// Allocate a sound buffer; fails on non-sound managers
    pub fn alloc_sound(&self, samples: usize) -> Result<SoundBuf> {
        match &self.inner.kind {
            BufMgrKind::Sound {
                plane_names,
                frame_size,
            } => SoundBuf::alloc(self.inner.mem.as_ref(), plane_names, *frame_size, samples),
            _ => Err(Error::Invalid),
        }
    }
}

impl std::fmt::Debug for BufMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner.kind {
            BufMgrKind::Block => "block",
            BufMgrKind::Pic { .. } => "pic",
            BufMgrKind::Sound { .. } => "sound",
        };
        f.debug_struct("BufMgr").field("kind", &kind).finish()
    }
}
