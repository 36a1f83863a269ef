//! Metal accelerator backend.
//!
//! Compiles the scanline kernel from MSL source against the system default
//! device. Only meaningful on Apple platforms; everywhere else the backend
//! compiles to a stub that reports itself unavailable, so the application
//! can register it unconditionally and let the router skip it.

#[macro_use]
extern crate log;

use lith_core::accel::{
    AccelError, AccelKind, Accelerator, AcceleratorInfo, AcceleratorSession, FrameDims,
};

/// The Metal backend, registered with the core router at startup.
#[derive(Default)]
pub struct Backend;

impl Backend {
    pub fn new() -> Backend {
        Backend
    }
}

impl Accelerator for Backend {
    fn kind(&self) -> AccelKind {
        AccelKind::Metal
    }

    fn available(&self) -> bool {
        imp::available()
    }

    fn probe(&self) -> Result<AcceleratorInfo, AccelError> {
        imp::probe()
    }

    fn open(&self, dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError> {
        imp::open(dims)
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use super::*;

    use metal::{
        Buffer, CommandQueue, CompileOptions, ComputePipelineState, Device, MTLResourceOptions,
        MTLSize,
    };

    /// Same transform as `lith_core::scanline::build_into`, one thread per
    /// output pixel; the Up filter delta is computed from this row's and
    /// the previous row's raw values, so threads never communicate.
    const KERNEL_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

static uchar raw_px(const device uchar* row, uint src_w, int sub)
{
    return (sub >= 0 && sub < (int)src_w) ? row[sub] : uchar(0);
}

static uchar grey_px(const device uchar* row, uint src_w, int base)
{
    ushort a = raw_px(row, src_w, base);
    ushort b = raw_px(row, src_w, base + 1);
    return uchar((a + b) >> 1);
}

kernel void build_scanlines(
    const device uchar* grey [[buffer(0)]],
    device uchar* out [[buffer(1)]],
    constant uint& src_w [[buffer(2)]],
    constant uint& height [[buffer(3)]],
    constant uint& out_width [[buffer(4)]],
    constant uint& channels [[buffer(5)]],
    constant uint& pad_left [[buffer(6)]],
    constant uint& layer_count [[buffer(7)]],
    uint3 gid [[thread_position_in_grid]])
{
    uint x = gid.x;
    uint y = gid.y;
    uint layer = gid.z;
    if (x >= out_width || y >= height || layer >= layer_count)
        return;

    ulong stride = 1ul + (ulong)out_width * channels;
    const device uchar* lgrey = grey + (ulong)layer * src_w * height;
    const device uchar* row = lgrey + (ulong)y * src_w;
    const device uchar* above = lgrey + (ulong)(y == 0 ? 0 : y - 1) * src_w;
    device uchar* orow = out + (ulong)layer * stride * height + (ulong)y * stride;

    if (x == 0)
        orow[0] = 2; /* PNG Up filter tag */

    if (channels == 3) {
        int base = (int)(x * 3) - (int)pad_left;
        for (uint k = 0; k < 3; ++k) {
            uchar cur = raw_px(row, src_w, base + (int)k);
            uchar up = (y == 0) ? uchar(0) : raw_px(above, src_w, base + (int)k);
            orow[1 + x * 3 + k] = uchar(cur - up);
        }
    } else {
        int base = (int)(x * 2) - (int)pad_left;
        uchar cur = grey_px(row, src_w, base);
        uchar up = (y == 0) ? uchar(0) : grey_px(above, src_w, base);
        orow[1 + x] = uchar(cur - up);
    }
}
"#;

    pub(super) fn available() -> bool {
        Device::system_default().is_some()
    }

    pub(super) fn probe() -> Result<AcceleratorInfo, AccelError> {
        let device = Device::system_default()
            .ok_or_else(|| AccelError::Unavailable("no Metal device".into()))?;
        Ok(AcceleratorInfo {
            device_name: device.name().to_owned(),
            vram_bytes: device.recommended_max_working_set_size(),
            has_tensor_cores: false,
        })
    }

    pub(super) fn open(dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError> {
        Ok(Box::new(Session::create(dims)?))
    }

    struct Session {
        device: Device,
        queue: CommandQueue,
        pipeline: ComputePipelineState,
        grey_buf: Option<Buffer>,
        out_buf: Option<Buffer>,
        dims: FrameDims,
    }

    // A session owns its queue and buffers exclusively; command buffers are
    // created, committed and waited on inside a single launch call.
    unsafe impl Send for Session {}

    impl Session {
        fn create(dims: &FrameDims) -> Result<Session, AccelError> {
            let device = Device::system_default()
                .ok_or_else(|| AccelError::Unavailable("no Metal device".into()))?;
            let library = device
                .new_library_with_source(KERNEL_SOURCE, &CompileOptions::new())
                .map_err(|e| {
                    error!("Metal kernel build failed: {}", e);
                    AccelError::LaunchFailed(-1)
                })?;
            let function = library
                .get_function("build_scanlines", None)
                .map_err(|_| AccelError::LaunchFailed(-2))?;
            let pipeline = device
                .new_compute_pipeline_state_with_function(&function)
                .map_err(|_| AccelError::LaunchFailed(-3))?;
            let queue = device.new_command_queue();
            debug!("Metal session ready for {:?}", dims);
            Ok(Session {
                device,
                queue,
                pipeline,
                grey_buf: None,
                out_buf: None,
                dims: *dims,
            })
        }

        fn ensure(slot: &mut Option<Buffer>, device: &Device, size: usize) -> Result<(), AccelError> {
            let need_alloc = match slot {
                Some(buf) => (buf.length() as usize) < size,
                None => true,
            };
            if need_alloc {
                *slot = Some(device.new_buffer(
                    size as u64,
                    MTLResourceOptions::StorageModeShared,
                ));
            }
            Ok(())
        }

        fn launch(
            &mut self,
            grey: &[u8],
            layer_count: u32,
            out: &mut [u8],
        ) -> Result<(), AccelError> {
            let dims = self.dims;
            let grey_len = dims.grey_len() * layer_count as usize;
            let out_len = dims.scanline_len() * layer_count as usize;
            debug_assert_eq!(grey.len(), grey_len);
            debug_assert_eq!(out.len(), out_len);

            Session::ensure(&mut self.grey_buf, &self.device, grey_len)?;
            Session::ensure(&mut self.out_buf, &self.device, out_len)?;
            let grey_buf = self.grey_buf.as_ref().expect("just ensured");
            let out_buf = self.out_buf.as_ref().expect("just ensured");

            unsafe {
                std::ptr::copy_nonoverlapping(
                    grey.as_ptr(),
                    grey_buf.contents() as *mut u8,
                    grey_len,
                );
            }

            let cmd = self.queue.new_command_buffer();
            let encoder = cmd.new_compute_command_encoder();
            encoder.set_compute_pipeline_state(&self.pipeline);
            encoder.set_buffer(0, Some(grey_buf), 0);
            encoder.set_buffer(1, Some(out_buf), 0);
            let scalars = [
                dims.src_w,
                dims.height,
                dims.out_width,
                dims.channels,
                dims.pad_left,
                layer_count,
            ];
            for (i, value) in scalars.iter().enumerate() {
                encoder.set_bytes(
                    (2 + i) as u64,
                    std::mem::size_of::<u32>() as u64,
                    value as *const u32 as *const std::ffi::c_void,
                );
            }
            let grid = MTLSize {
                width: dims.out_width as u64,
                height: dims.height as u64,
                depth: layer_count as u64,
            };
            let threads_per_group = MTLSize {
                width: 16,
                height: 16,
                depth: 1,
            };
            encoder.dispatch_threads(grid, threads_per_group);
            encoder.end_encoding();
            cmd.commit();
            cmd.wait_until_completed();

            unsafe {
                std::ptr::copy_nonoverlapping(
                    out_buf.contents() as *const u8,
                    out.as_mut_ptr(),
                    out_len,
                );
            }
            Ok(())
        }
    }

    impl AcceleratorSession for Session {
        fn build_scanlines(&mut self, grey: &[u8], out: &mut [u8]) -> Result<(), AccelError> {
            self.launch(grey, 1, out)
        }

        fn batch_build_scanlines(
            &mut self,
            grey: &[u8],
            layer_count: u32,
            out: &mut [u8],
        ) -> Result<(), AccelError> {
            self.launch(grey, layer_count, out)
        }
    }
}

#[cfg(not(target_os = "macos"))]
mod imp {
    use super::*;

    pub(super) fn available() -> bool {
        false
    }

    pub(super) fn probe() -> Result<AcceleratorInfo, AccelError> {
        Err(AccelError::Unavailable("not an Apple platform".into()))
    }

    pub(super) fn open(dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError> {
        debug!("metal backend asked to open for {:?} off-platform", dims);
        Err(AccelError::Unavailable("not an Apple platform".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_or_device_probe_is_consistent() {
        let backend = Backend::new();
        if backend.available() {
            let info = backend.probe().expect("available backend must probe");
            assert!(!info.device_name.is_empty());
        } else {
            assert!(backend.probe().is_err());
        }
    }
}
