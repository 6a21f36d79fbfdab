//! Picture Buffers
//!
//! A picture is a set of planes, each identified by its chroma name
//! ("y8", "u8", "v8", "r8g8b8a8", ...) with horizontal/vertical
//! subsampling, a macropixel size and a stride. Every plane owns its own
//! shared region; duplication shares all planes and copy-on-write detaches
//! only the planes actually written.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mem::MemAlloc;

use super::SharedMem;

/// Static description of one plane of a picture format
#[derive(Debug, Clone)]
pub struct PlaneDesc {
    /// Chroma name, e.g. "y8"
    pub chroma: &'static str,
    /// Horizontal subsampling factor (1 = full resolution)
    pub hsub: usize,
    /// Vertical subsampling factor
    pub vsub: usize,
    /// Bytes per macropixel in this plane
    pub macropixel_size: usize,
}

/// A picture format: macropixel width and plane set
#[derive(Debug, Clone)]
pub struct PicFormat {
    /// Pixels per macropixel (2 for 4:2:2 packed, 1 for planar)
    pub macropixel: usize,
    /// Planes, outermost luma first by convention
    pub planes: Vec<PlaneDesc>,
}

impl PicFormat {
    /// Planar 4:2:0, 8 bits per sample
    pub fn yuv420p() -> Self {
        Self {
            macropixel: 1,
            planes: vec![
                PlaneDesc { chroma: "y8", hsub: 1, vsub: 1, macropixel_size: 1 },
                PlaneDesc { chroma: "u8", hsub: 2, vsub: 2, macropixel_size: 1 },
                PlaneDesc { chroma: "v8", hsub: 2, vsub: 2, macropixel_size: 1 },
            ],
        }
    }

    /// Packed RGBA, 8 bits per channel
    pub fn rgba() -> Self {
        Self {
            macropixel: 1,
            planes: vec![PlaneDesc {
                chroma: "r8g8b8a8",
                hsub: 1,
                vsub: 1,
                macropixel_size: 4,
            }],
        }
    }

    /// Whether `hsize`/`vsize` are representable in this format
    pub fn check_size(&self, hsize: usize, vsize: usize) -> Result<()> {
        if hsize == 0 || vsize == 0 || hsize % self.macropixel != 0 {
            return Err(Error::Invalid);
        }
        for plane in &self.planes {
            if hsize % (plane.hsub * self.macropixel) != 0 || vsize % plane.vsub != 0 {
                return Err(Error::Invalid);
            }
        }
        Ok(())
    }
}

struct Plane {
    desc: PlaneDesc,
    shared: SharedMem,
    stride: usize,
    /// Aligned start of the pixel data inside the region
    base: usize,
}

/// Picture payload
pub struct PicBuf {
    format: Arc<PicFormat>,
    hsize: usize,
    vsize: usize,
    planes: Vec<Plane>,
}

impl PicBuf {
    /// Allocate a zeroed picture
    ///
    /// `align` pads every stride and base pointer to the given power of two
    /// (0 or 1 for none); downstream SIMD consumers request it through flow
    /// format negotiation.
    pub fn alloc(
        alloc: &dyn MemAlloc,
        format: &Arc<PicFormat>,
        hsize: usize,
        vsize: usize,
        align: usize,
    ) -> Result<Self> {
        format.check_size(hsize, vsize)?;
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(Error::Invalid);
        }
        let mut planes = Vec::with_capacity(format.planes.len());
        for desc in &format.planes {
            let pixels = hsize / (desc.hsub * format.macropixel);
            let stride = (pixels * desc.macropixel_size).next_multiple_of(align);
            let lines = vsize / desc.vsub;
            let mem = alloc.alloc(stride * lines + align - 1)?;
            let base = {
                let addr = mem.as_slice().as_ptr() as usize;
                addr.next_multiple_of(align) - addr
            };
            planes.push(Plane {
                desc: desc.clone(),
                shared: SharedMem::new(mem),
                stride,
                base,
            });
        }
        Ok(Self {
            format: Arc::clone(format),
            hsize,
            vsize,
            planes,
        })
    }

    /// Picture width in pixels
    pub fn hsize(&self) -> usize {
        self.hsize
    }

    /// Picture height in pixels
    pub fn vsize(&self) -> usize {
        self.vsize
    }

    /// The format shared by all pictures from the same allocator
    pub fn format(&self) -> &Arc<PicFormat> {
        &self.format
    }

    /// Iterate plane chroma names
    pub fn plane_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.planes.iter().map(|p| p.desc.chroma)
    }

    fn plane(&self, chroma: &str) -> Result<&Plane> {
        self.planes
            .iter()
            .find(|p| p.desc.chroma == chroma)
            .ok_or(Error::Invalid)
    }

    fn plane_mut(&mut self, chroma: &str) -> Result<&mut Plane> {
        self.planes
            .iter_mut()
            .find(|p| p.desc.chroma == chroma)
            .ok_or(Error::Invalid)
    }

    fn plane_data_len(&self, plane: &Plane) -> usize {
        plane.stride * (self.vsize / plane.desc.vsub)
    }

    /// Read-map a plane; returns (pixel data, stride)
    pub fn plane_read(&self, chroma: &str) -> Result<(&[u8], usize)> {
        let plane = self.plane(chroma)?;
        let len = self.plane_data_len(plane);
        Ok((
            &plane.shared.as_slice()[plane.base..plane.base + len],
            plane.stride,
        ))
    }

    /// Write-map a plane; fails with `Busy` while the plane is shared
    pub fn plane_write(&mut self, chroma: &str) -> Result<(&mut [u8], usize)> {
        let vsize = self.vsize;
        let plane = self.plane_mut(chroma)?;
        let len = plane.stride * (vsize / plane.desc.vsub);
        let stride = plane.stride;
        let range = plane.base..plane.base + len;
        let slice = plane.shared.try_mut()?;
        Ok((&mut slice[range], stride))
    }

    /// Copy-on-write the named plane if it is shared
    pub fn plane_make_writable(&mut self, alloc: &dyn MemAlloc, chroma: &str) -> Result<()> {
        let vsize = self.vsize;
        let plane = self.plane_mut(chroma)?;
        if !plane.shared.is_shared() {
            return Ok(());
        }
        let len = plane.stride * (vsize / plane.desc.vsub);
        let mut mem = alloc.alloc(len)?;
        mem.as_mut_slice()
            .copy_from_slice(&plane.shared.as_slice()[plane.base..plane.base + len]);
        plane.shared = SharedMem::new(mem);
        plane.base = 0;
        Ok(())
    }

    /// Share the picture (refcount clone of every plane)
    pub fn dup(&self) -> PicBuf {
        PicBuf {
            format: Arc::clone(&self.format),
            hsize: self.hsize,
            vsize: self.vsize,
            planes: self
                .planes
                .iter()
                .map(|p| Plane {
                    desc: p.desc.clone(),
                    shared: p.shared.clone(),
                    stride: p.stride,
                    base: p.base,
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for PicBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PicBuf")
            .field("hsize", &self.hsize)
            .field("vsize", &self.vsize)
            .field("planes", &self.planes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapAlloc;

    #[test]
    fn yuv420_geometry() {
        let format = Arc::new(PicFormat::yuv420p());
        let pic = PicBuf::alloc(&HeapAlloc, &format, 64, 48, 16).unwrap();
        let (y, y_stride) = pic.plane_read("y8").unwrap();
        assert_eq!(y_stride % 16, 0);
        assert_eq!(y.len(), y_stride * 48);
        let (u, u_stride) = pic.plane_read("u8").unwrap();
        assert_eq!(u.len(), u_stride * 24);
    }

    #[test]
    fn odd_sizes_rejected() {
        let format = Arc::new(PicFormat::yuv420p());
        assert_eq!(
            PicBuf::alloc(&HeapAlloc, &format, 63, 48, 1).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn shared_plane_write_is_busy() {
        let format = Arc::new(PicFormat::rgba());
        let mut pic = PicBuf::alloc(&HeapAlloc, &format, 8, 8, 1).unwrap();
        let copy = pic.dup();
        assert_eq!(pic.plane_write("r8g8b8a8").unwrap_err(), Error::Busy);
        pic.plane_make_writable(&HeapAlloc, "r8g8b8a8").unwrap();
        let (data, _) = pic.plane_write("r8g8b8a8").unwrap();
        data[0] = 0xff;
        let (orig, _) = copy.plane_read("r8g8b8a8").unwrap();
        assert_eq!(orig[0], 0);
    }
}
