//! Sound Buffers
//!
//! Samples either interleaved in one plane or planar with one plane per
//! channel group. The sample size is per channel and frame; a stereo
//! s16 interleaved buffer has one plane with 4 bytes per frame.

use crate::error::{Error, Result};
use crate::mem::MemAlloc;

use super::SharedMem;

struct SoundPlane {
    /// Channel layout tag of this plane ("lr", "l", "r", "c", ...)
    name: &'static str,
    shared: SharedMem,
}

/// Audio payload
pub struct SoundBuf {
    planes: Vec<SoundPlane>,
    /// Frames per plane
    samples: usize,
    /// Bytes per frame in each plane
    frame_size: usize,
}

impl SoundBuf {
    /// Allocate zeroed storage for `samples` frames
    ///
    /// `plane_names` has one entry per plane; `frame_size` is bytes per
    /// frame within one plane (sample size times channels for interleaved
    /// planes).
    pub fn alloc(
        alloc: &dyn MemAlloc,
        plane_names: &[&'static str],
        frame_size: usize,
        samples: usize,
    ) -> Result<Self> {
        if plane_names.is_empty() || frame_size == 0 {
            return Err(Error::Invalid);
        }
        let mut planes = Vec::with_capacity(plane_names.len());
        for name in plane_names {
            planes.push(SoundPlane {
                name,
                shared: SharedMem::new(alloc.alloc(frame_size * samples)?),
            });
        }
        Ok(Self {
            planes,
            samples,
            frame_size,
        })
    }

    /// Frames in the buffer
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Bytes per frame per plane
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Iterate plane names
    pub fn plane_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.planes.iter().map(|p| p.name)
    }

    /// Read-map a plane
    pub fn plane_read(&self, name: &str) -> Result<&[u8]> {
        let plane = self
            .planes
            .iter()
            .find(|p| p.name == name)
            .ok_or(Error::Invalid)?;
        Ok(&plane.shared.as_slice()[..self.frame_size * self.samples])
    }

    /// Write-map a plane; `Busy` while shared
    pub fn plane_write(&mut self, name: &str) -> Result<&mut [u8]> {
        let len = self.frame_size * self.samples;
        let plane = self
            .planes
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or(Error::Invalid)?;
        Ok(&mut plane.shared.try_mut()?[..len])
    }

    /// Copy-on-write any shared plane
    pub fn make_writable(&mut self, alloc: &dyn MemAlloc) -> Result<()> {
        let len = self.frame_size * self.samples;
        for plane in &mut self.planes {
            if plane.shared.is_shared() {
                let mut mem = alloc.alloc(len)?;
                mem.as_mut_slice()
                    .copy_from_slice(&plane.shared.as_slice()[..len]);
                plane.shared = SharedMem::new(mem);
            }
        }
        Ok(())
    }

    /// Drop `skip` leading frames and cut to `new_samples`
    ///
    /// Cheap metadata-only operation would need per-plane offsets; sound
    /// packets are small, so this copies. Fails with `Busy` when shared.
    pub fn resize(&mut self, skip: usize, new_samples: usize) -> Result<()> {
        if skip + new_samples > self.samples {
            return Err(Error::Invalid);
        }
        let fs = self.frame_size;
        for plane in &mut self.planes {
            let data = plane.shared.try_mut()?;
            data.copy_within(skip * fs..(skip + new_samples) * fs, 0);
        }
        self.samples = new_samples;
        Ok(())
    }

    /// Share the buffer (refcount clone of every plane)
    pub fn dup(&self) -> SoundBuf {
        SoundBuf {
            planes: self
                .planes
                .iter()
                .map(|p| SoundPlane {
                    name: p.name,
                    shared: p.shared.clone(),
                })
                .collect(),
            samples: self.samples,
            frame_size: self.frame_size,
        }
    }
}

impl std::fmt::Debug for SoundBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundBuf")
            .field("samples", &self.samples)
            .field("frame_size", &self.frame_size)
            .field("planes", &self.planes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapAlloc;

    #[test]
    fn interleaved_stereo() {
        let mut buf = SoundBuf::alloc(&HeapAlloc, &["lr"], 4, 1024).unwrap();
        assert_eq!(buf.samples(), 1024);
        buf.plane_write("lr").unwrap()[0] = 0x7f;
        assert_eq!(buf.plane_read("lr").unwrap()[0], 0x7f);
    }

    #[test]
    fn planar_busy_after_dup() {
        let mut buf = SoundBuf::alloc(&HeapAlloc, &["l", "r"], 2, 16).unwrap();
        let copy = buf.dup();
        assert_eq!(buf.plane_write("l").unwrap_err(), Error::Busy);
        buf.make_writable(&HeapAlloc).unwrap();
        buf.plane_write("l").unwrap()[0] = 1;
        assert_eq!(copy.plane_read("l").unwrap()[0], 0);
    }

    #[test]
    fn resize_shifts_frames() {
        let mut buf = SoundBuf::alloc(&HeapAlloc, &["lr"], 2, 4).unwrap();
        buf.plane_write("lr")
            .unwrap()
            .copy_from_slice(&[0, 0, 1, 1, 2, 2, 3, 3]);
        buf.resize(1, 2).unwrap();
        assert_eq!(buf.samples(), 2);
        assert_eq!(&buf.plane_read("lr").unwrap()[..4], &[1, 1, 2, 2]);
    }
}
