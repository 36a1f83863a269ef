//! OpenCL accelerator backend.
//!
//! Probes the system OpenCL library at runtime (no build-time dependency),
//! compiles the scanline kernel for the first GPU device and runs the
//! remap + Up-filter transform on it. Output is byte-identical to the CPU
//! path in `lith_core::scanline`; every PNG filter delta is computable from
//! the raw values of its own and the previous row, so the kernel needs no
//! cross-row synchronization.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

mod ffi;

use std::ffi::CString;
use std::os::raw::c_void;
use std::ptr;

use lith_core::accel::{
    AccelError, AccelKind, Accelerator, AcceleratorInfo, AcceleratorSession, FrameDims,
};

use crate::ffi::*;

/// Scanline kernel, compiled per session. `raw_px` mirrors the CPU path's
/// out-of-range-reads-as-zero rule; the Up filter is folded in by sampling
/// the previous row's raw value in the same work item.
const KERNEL_SOURCE: &str = r#"
uchar raw_px(__global const uchar* row, uint src_w, int sub) {
    return (sub >= 0 && sub < (int)src_w) ? row[sub] : (uchar)0;
}

uchar grey_px(__global const uchar* row, uint src_w, int base) {
    ushort a = (ushort)raw_px(row, src_w, base);
    ushort b = (ushort)raw_px(row, src_w, base + 1);
    return (uchar)((a + b) >> 1);
}

__kernel void build_scanlines(
    __global const uchar* grey,
    __global uchar* out,
    uint src_w,
    uint height,
    uint out_width,
    uint channels,
    uint pad_left,
    uint layer_count)
{
    uint x = get_global_id(0);
    uint y = get_global_id(1);
    uint layer = get_global_id(2);
    if (x >= out_width || y >= height || layer >= layer_count)
        return;

    ulong stride = 1ul + (ulong)out_width * channels;
    __global const uchar* lgrey = grey + (ulong)layer * src_w * height;
    __global const uchar* row = lgrey + (ulong)y * src_w;
    uint y_above = (y == 0) ? 0u : y - 1;
    __global const uchar* above = lgrey + (ulong)y_above * src_w;
    __global uchar* orow = out + (ulong)layer * stride * height + (ulong)y * stride;

    if (x == 0)
        orow[0] = 2; /* PNG Up filter tag */

    if (channels == 3) {
        int base = (int)(x * 3) - (int)pad_left;
        for (uint k = 0; k < 3; ++k) {
            uchar cur = raw_px(row, src_w, base + (int)k);
            uchar up = (y == 0) ? (uchar)0 : raw_px(above, src_w, base + (int)k);
            orow[1 + x * 3 + k] = (uchar)(cur - up);
        }
    } else {
        int base = (int)(x * 2) - (int)pad_left;
        uchar cur = grey_px(row, src_w, base);
        uchar up = (y == 0) ? (uchar)0 : grey_px(above, src_w, base);
        orow[1 + x] = (uchar)(cur - up);
    }
}
"#;

lazy_static! {
    static ref CL: Result<ClApi, String> = ClApi::load();
}

/// The OpenCL backend, registered with the core router at startup.
#[derive(Default)]
pub struct Backend;

impl Backend {
    pub fn new() -> Backend {
        Backend
    }
}

impl Accelerator for Backend {
    fn kind(&self) -> AccelKind {
        AccelKind::OpenCl
    }

    fn available(&self) -> bool {
        CL.is_ok()
    }

    fn probe(&self) -> Result<AcceleratorInfo, AccelError> {
        let api = api()?;
        let (_, device) = first_gpu(api)?;
        let device_name = device_name(api, device);
        let mut vram_bytes: u64 = 0;
        let rc = unsafe {
            (api.clGetDeviceInfo)(
                device,
                CL_DEVICE_GLOBAL_MEM_SIZE,
                std::mem::size_of::<u64>(),
                &mut vram_bytes as *mut u64 as *mut c_void,
                ptr::null_mut(),
            )
        };
        if rc != CL_SUCCESS {
            return Err(AccelError::Unavailable(format!(
                "clGetDeviceInfo failed ({})",
                rc
            )));
        }
        Ok(AcceleratorInfo {
            device_name,
            vram_bytes,
            has_tensor_cores: false,
        })
    }

    fn open(&self, dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError> {
        Ok(Box::new(Session::create(dims)?))
    }
}

fn api() -> Result<&'static ClApi, AccelError> {
    CL.as_ref().map_err(|e| AccelError::Unavailable(e.clone()))
}

fn first_gpu(api: &ClApi) -> Result<(cl_platform_id, cl_device_id), AccelError> {
    let mut count: cl_uint = 0;
    let rc = unsafe { (api.clGetPlatformIDs)(0, ptr::null_mut(), &mut count) };
    if rc != CL_SUCCESS || count == 0 {
        return Err(AccelError::Unavailable("no OpenCL platforms".into()));
    }
    let mut platforms = vec![ptr::null_mut(); count as usize];
    let rc = unsafe { (api.clGetPlatformIDs)(count, platforms.as_mut_ptr(), &mut count) };
    if rc != CL_SUCCESS {
        return Err(AccelError::Unavailable(format!(
            "clGetPlatformIDs failed ({})",
            rc
        )));
    }
    for platform in platforms {
        let mut device: cl_device_id = ptr::null_mut();
        let mut found: cl_uint = 0;
        let rc = unsafe {
            (api.clGetDeviceIDs)(platform, CL_DEVICE_TYPE_GPU, 1, &mut device, &mut found)
        };
        if rc == CL_SUCCESS && found > 0 {
            return Ok((platform, device));
        }
    }
    Err(AccelError::Unavailable("no OpenCL GPU device".into()))
}

fn device_name(api: &ClApi, device: cl_device_id) -> String {
    let mut buf = [0u8; 256];
    let mut len: usize = 0;
    let rc = unsafe {
        (api.clGetDeviceInfo)(
            device,
            CL_DEVICE_NAME,
            buf.len(),
            buf.as_mut_ptr() as *mut c_void,
            &mut len,
        )
    };
    if rc != CL_SUCCESS || len == 0 {
        return "unknown OpenCL device".into();
    }
    String::from_utf8_lossy(&buf[..len.saturating_sub(1).min(buf.len())]).into_owned()
}

/// Device buffer that grows on demand and is released with the session.
struct DeviceBuffer {
    mem: cl_mem,
    capacity: usize,
    flags: cl_bitfield,
}

impl DeviceBuffer {
    fn empty(flags: cl_bitfield) -> DeviceBuffer {
        DeviceBuffer {
            mem: ptr::null_mut(),
            capacity: 0,
            flags,
        }
    }

    fn ensure(&mut self, api: &ClApi, context: cl_context, size: usize) -> Result<(), AccelError> {
        if size <= self.capacity && !self.mem.is_null() {
            return Ok(());
        }
        self.release(api);
        let mut rc: cl_int = CL_SUCCESS;
        let mem =
            unsafe { (api.clCreateBuffer)(context, self.flags, size, ptr::null_mut(), &mut rc) };
        if rc != CL_SUCCESS || mem.is_null() {
            return Err(match rc {
                CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_RESOURCES | CL_OUT_OF_HOST_MEMORY => {
                    AccelError::OutOfDeviceMemory(size as u64)
                }
                _ => AccelError::LaunchFailed(rc),
            });
        }
        self.mem = mem;
        self.capacity = size;
        Ok(())
    }

    fn release(&mut self, api: &ClApi) {
        if !self.mem.is_null() {
            unsafe {
                (api.clReleaseMemObject)(self.mem);
            }
            self.mem = ptr::null_mut();
            self.capacity = 0;
        }
    }
}

struct Session {
    api: &'static ClApi,
    context: cl_context,
    queue: cl_command_queue,
    program: cl_program,
    kernel: cl_kernel,
    grey_buf: DeviceBuffer,
    out_buf: DeviceBuffer,
    dims: FrameDims,
}

// The session owns its context, queue and buffers exclusively; OpenCL
// handles may cross threads as long as calls are not interleaved, and the
// scheduler never shares a session between workers.
unsafe impl Send for Session {}

impl Session {
    fn create(dims: &FrameDims) -> Result<Session, AccelError> {
        let api = api()?;
        let (_, device) = first_gpu(api)?;

        let mut rc: cl_int = CL_SUCCESS;
        let context = unsafe {
            (api.clCreateContext)(ptr::null(), 1, &device, ptr::null(), ptr::null_mut(), &mut rc)
        };
        if rc != CL_SUCCESS || context.is_null() {
            return Err(AccelError::Unavailable(format!(
                "clCreateContext failed ({})",
                rc
            )));
        }

        let queue = unsafe { (api.clCreateCommandQueue)(context, device, 0, &mut rc) };
        if rc != CL_SUCCESS || queue.is_null() {
            unsafe {
                (api.clReleaseContext)(context);
            }
            return Err(AccelError::Unavailable(format!(
                "clCreateCommandQueue failed ({})",
                rc
            )));
        }

        let source = CString::new(KERNEL_SOURCE).expect("kernel source has no NUL");
        let source_ptr = source.as_ptr();
        let program = unsafe {
            (api.clCreateProgramWithSource)(context, 1, &source_ptr, ptr::null(), &mut rc)
        };
        if rc != CL_SUCCESS || program.is_null() {
            unsafe {
                (api.clReleaseCommandQueue)(queue);
                (api.clReleaseContext)(context);
            }
            return Err(AccelError::LaunchFailed(rc));
        }
        let rc_build =
            unsafe { (api.clBuildProgram)(program, 1, &device, ptr::null(), ptr::null(), ptr::null_mut()) };
        if rc_build != CL_SUCCESS {
            error!("OpenCL kernel build failed ({})", rc_build);
            unsafe {
                (api.clReleaseProgram)(program);
                (api.clReleaseCommandQueue)(queue);
                (api.clReleaseContext)(context);
            }
            return Err(AccelError::LaunchFailed(rc_build));
        }

        let entry = CString::new("build_scanlines").expect("entry name has no NUL");
        let kernel = unsafe { (api.clCreateKernel)(program, entry.as_ptr(), &mut rc) };
        if rc != CL_SUCCESS || kernel.is_null() {
            unsafe {
                (api.clReleaseProgram)(program);
                (api.clReleaseCommandQueue)(queue);
                (api.clReleaseContext)(context);
            }
            return Err(AccelError::LaunchFailed(rc));
        }

        debug!("OpenCL session ready for {:?}", dims);
        Ok(Session {
            api,
            context,
            queue,
            program,
            kernel,
            grey_buf: DeviceBuffer::empty(CL_MEM_READ_ONLY),
            out_buf: DeviceBuffer::empty(CL_MEM_WRITE_ONLY),
            dims: *dims,
        })
    }

    fn launch(&mut self, grey: &[u8], layer_count: u32, out: &mut [u8]) -> Result<(), AccelError> {
        let api = self.api;
        let dims = self.dims;
        let grey_len = dims.grey_len() * layer_count as usize;
        let out_len = dims.scanline_len() * layer_count as usize;
        debug_assert_eq!(grey.len(), grey_len);
        debug_assert_eq!(out.len(), out_len);

        self.grey_buf.ensure(api, self.context, grey_len)?;
        self.out_buf.ensure(api, self.context, out_len)?;

        let rc = unsafe {
            (api.clEnqueueWriteBuffer)(
                self.queue,
                self.grey_buf.mem,
                CL_TRUE,
                0,
                grey_len,
                grey.as_ptr() as *const c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if rc != CL_SUCCESS {
            return Err(AccelError::TransferFailed(rc));
        }

        let args: [(usize, *const c_void); 8] = [
            (std::mem::size_of::<cl_mem>(), &self.grey_buf.mem as *const cl_mem as *const c_void),
            (std::mem::size_of::<cl_mem>(), &self.out_buf.mem as *const cl_mem as *const c_void),
            (4, &dims.src_w as *const u32 as *const c_void),
            (4, &dims.height as *const u32 as *const c_void),
            (4, &dims.out_width as *const u32 as *const c_void),
            (4, &dims.channels as *const u32 as *const c_void),
            (4, &dims.pad_left as *const u32 as *const c_void),
            (4, &layer_count as *const u32 as *const c_void),
        ];
        for (index, (size, value)) in args.iter().enumerate() {
            let rc = unsafe { (api.clSetKernelArg)(self.kernel, index as cl_uint, *size, *value) };
            if rc != CL_SUCCESS {
                return Err(AccelError::LaunchFailed(rc));
            }
        }

        let global = [
            dims.out_width as usize,
            dims.height as usize,
            layer_count as usize,
        ];
        let rc = unsafe {
            (api.clEnqueueNDRangeKernel)(
                self.queue,
                self.kernel,
                3,
                ptr::null(),
                global.as_ptr(),
                ptr::null(),
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if rc != CL_SUCCESS {
            return Err(AccelError::LaunchFailed(rc));
        }

        let rc = unsafe {
            (api.clEnqueueReadBuffer)(
                self.queue,
                self.out_buf.mem,
                CL_TRUE,
                0,
                out_len,
                out.as_mut_ptr() as *mut c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if rc != CL_SUCCESS {
            return Err(AccelError::TransferFailed(rc));
        }
        let rc = unsafe { (api.clFinish)(self.queue) };
        if rc != CL_SUCCESS {
            return Err(AccelError::TransferFailed(rc));
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

impl Drop for Session {
    fn drop(&mut self) {
        let api = self.api;
        self.grey_buf.release(api);
        self.out_buf.release(api);
        unsafe {
            (api.clReleaseKernel)(self.kernel);
            (api.clReleaseProgram)(self.program);
            (api.clReleaseCommandQueue)(self.queue);
            (api.clReleaseContext)(self.context);
        }
    }
}
