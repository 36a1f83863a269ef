//! CUDA accelerator backend.
//!
//! Uses the driver API, loaded at runtime, so nothing links against the
//! toolkit at build time. The scanline kernel is CUDA C compiled through
//! NVRTC when the session opens; both the driver and NVRTC being present is
//! what `available()` reports. Output matches the CPU scanline path byte
//! for byte.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

mod ffi;

use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::ptr;

use lith_core::accel::{
    AccelError, AccelKind, Accelerator, AcceleratorInfo, AcceleratorSession, FrameDims,
};

use crate::ffi::*;

const BLOCK_DIM: u32 = 16;

/// Same transform as `lith_core::scanline::build_into`, one thread per
/// output pixel, previous-row raw values recomputed in-thread so the Up
/// filter needs no synchronization.
const KERNEL_SOURCE: &str = r#"
__device__ unsigned char raw_px(const unsigned char* row, unsigned int src_w, int sub)
{
    return (sub >= 0 && sub < (int)src_w) ? row[sub] : (unsigned char)0;
}

__device__ unsigned char grey_px(const unsigned char* row, unsigned int src_w, int base)
{
    unsigned short a = raw_px(row, src_w, base);
    unsigned short b = raw_px(row, src_w, base + 1);
    return (unsigned char)((a + b) >> 1);
}

extern "C" __global__ void build_scanlines(
    const unsigned char* grey,
    unsigned char* out,
    unsigned int src_w,
    unsigned int height,
    unsigned int out_width,
    unsigned int channels,
    unsigned int pad_left,
    unsigned int layer_count)
{
    unsigned int x = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int y = blockIdx.y * blockDim.y + threadIdx.y;
    unsigned int layer = blockIdx.z;
    if (x >= out_width || y >= height || layer >= layer_count)
        return;

    unsigned long long stride = 1ull + (unsigned long long)out_width * channels;
    const unsigned char* lgrey = grey + (unsigned long long)layer * src_w * height;
    const unsigned char* row = lgrey + (unsigned long long)y * src_w;
    const unsigned char* above = lgrey + (unsigned long long)(y == 0 ? 0 : y - 1) * src_w;
    unsigned char* orow = out + (unsigned long long)layer * stride * height
        + (unsigned long long)y * stride;

    if (x == 0)
        orow[0] = 2; /* PNG Up filter tag */

    if (channels == 3) {
        int base = (int)(x * 3) - (int)pad_left;
        for (unsigned int k = 0; k < 3; ++k) {
            unsigned char cur = raw_px(row, src_w, base + (int)k);
            unsigned char up = (y == 0) ? (unsigned char)0
                                        : raw_px(above, src_w, base + (int)k);
            orow[1 + x * 3 + k] = (unsigned char)(cur - up);
        }
    } else {
        int base = (int)(x * 2) - (int)pad_left;
        unsigned char cur = grey_px(row, src_w, base);
        unsigned char up = (y == 0) ? (unsigned char)0 : grey_px(above, src_w, base);
        orow[1 + x] = (unsigned char)(cur - up);
    }
}
"#;

lazy_static! {
    static ref CUDA: Result<CudaApi, String> = CudaApi::load().and_then(|api| {
        let rc = unsafe { (api.cuInit)(0) };
        if rc == CUDA_SUCCESS {
            Ok(api)
        } else {
            Err(format!("cuInit failed ({})", rc))
        }
    });
    static ref NVRTC: Result<NvrtcApi, String> = NvrtcApi::load();
}

/// The CUDA backend, registered with the core router at startup.
#[derive(Default)]
pub struct Backend;

impl Backend {
    pub fn new() -> Backend {
        Backend
    }
}

impl Accelerator for Backend {
    fn kind(&self) -> AccelKind {
        AccelKind::Cuda
    }

    fn available(&self) -> bool {
        CUDA.is_ok() && NVRTC.is_ok()
    }

    fn probe(&self) -> Result<AcceleratorInfo, AccelError> {
        let api = cuda()?;
        let device = first_device(api)?;

        let mut name = [0u8; 256];
        let rc = unsafe {
            (api.cuDeviceGetName)(name.as_mut_ptr() as *mut _, name.len() as c_int, device)
        };
        let device_name = if rc == CUDA_SUCCESS {
            let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            String::from_utf8_lossy(&name[..end]).into_owned()
        } else {
            "unknown CUDA device".into()
        };

        let mut vram: usize = 0;
        let rc = unsafe { (api.cuDeviceTotalMem)(&mut vram, device) };
        if rc != CUDA_SUCCESS {
            return Err(AccelError::Unavailable(format!(
                "cuDeviceTotalMem failed ({})",
                rc
            )));
        }

        // Tensor cores arrived with compute capability 7.x (Volta).
        let mut major: c_int = 0;
        let rc = unsafe {
            (api.cuDeviceGetAttribute)(
                &mut major,
                CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                device,
            )
        };
        let has_tensor_cores = rc == CUDA_SUCCESS && major >= 7;

        Ok(AcceleratorInfo {
            device_name,
            vram_bytes: vram as u64,
            has_tensor_cores,
        })
    }

    fn open(&self, dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError> {
        Ok(Box::new(Session::create(dims)?))
    }
}

fn cuda() -> Result<&'static CudaApi, AccelError> {
    CUDA.as_ref().map_err(|e| AccelError::Unavailable(e.clone()))
}

fn nvrtc() -> Result<&'static NvrtcApi, AccelError> {
    NVRTC
        .as_ref()
        .map_err(|e| AccelError::Unavailable(e.clone()))
}

fn first_device(api: &CudaApi) -> Result<CUdevice, AccelError> {
    let mut count: c_int = 0;
    let rc = unsafe { (api.cuDeviceGetCount)(&mut count) };
    if rc != CUDA_SUCCESS || count == 0 {
        return Err(AccelError::Unavailable("no CUDA devices".into()));
    }
    let mut device: CUdevice = 0;
    let rc = unsafe { (api.cuDeviceGet)(&mut device, 0) };
    if rc != CUDA_SUCCESS {
        return Err(AccelError::Unavailable(format!(
            "cuDeviceGet failed ({})",
            rc
        )));
    }
    Ok(device)
}

fn compile_ptx() -> Result<Vec<u8>, AccelError> {
    let api = nvrtc()?;
    let source = CString::new(KERNEL_SOURCE).expect("kernel source has no NUL");
    let name = CString::new("build_scanlines.cu").expect("name has no NUL");

    let mut program: nvrtcProgram = ptr::null_mut();
    let rc = unsafe {
        (api.nvrtcCreateProgram)(
            &mut program,
            source.as_ptr(),
            name.as_ptr(),
            0,
            ptr::null(),
            ptr::null(),
        )
    };
    if rc != NVRTC_SUCCESS {
        return Err(AccelError::LaunchFailed(rc));
    }

    let rc = unsafe { (api.nvrtcCompileProgram)(program, 0, ptr::null()) };
    if rc != NVRTC_SUCCESS {
        let mut log_len: usize = 0;
        unsafe {
            if (api.nvrtcGetProgramLogSize)(program, &mut log_len) == NVRTC_SUCCESS && log_len > 1 {
                let mut buf = vec![0u8; log_len];
                if (api.nvrtcGetProgramLog)(program, buf.as_mut_ptr() as *mut _) == NVRTC_SUCCESS {
                    error!(
                        "NVRTC compile failed: {}",
                        String::from_utf8_lossy(&buf[..log_len - 1])
                    );
                }
            }
            (api.nvrtcDestroyProgram)(&mut program);
        }
        return Err(AccelError::LaunchFailed(rc));
    }

    let mut ptx_len: usize = 0;
    let rc = unsafe { (api.nvrtcGetPTXSize)(program, &mut ptx_len) };
    if rc != NVRTC_SUCCESS {
        unsafe {
            (api.nvrtcDestroyProgram)(&mut program);
        }
        return Err(AccelError::LaunchFailed(rc));
    }
    let mut ptx = vec![0u8; ptx_len];
    let rc = unsafe { (api.nvrtcGetPTX)(program, ptx.as_mut_ptr() as *mut _) };
    unsafe {
        (api.nvrtcDestroyProgram)(&mut program);
    }
    if rc != NVRTC_SUCCESS {
        return Err(AccelError::LaunchFailed(rc));
    }
    Ok(ptx)
}

/// Growable device allocation.
struct DeviceBuffer {
    ptr: CUdeviceptr,
    capacity: usize,
}

impl DeviceBuffer {
    fn empty() -> DeviceBuffer {
        DeviceBuffer {
            ptr: 0,
            capacity: 0,
        }
    }

    fn ensure(&mut self, api: &CudaApi, size: usize) -> Result<(), AccelError> {
        if size <= self.capacity && self.ptr != 0 {
            return Ok(());
        }
        self.release(api);
        let rc = unsafe { (api.cuMemAlloc)(&mut self.ptr, size) };
        if rc != CUDA_SUCCESS {
            self.ptr = 0;
            return Err(if rc == CUDA_ERROR_OUT_OF_MEMORY {
                AccelError::OutOfDeviceMemory(size as u64)
            } else {
                AccelError::LaunchFailed(rc)
            });
        }
        self.capacity = size;
        Ok(())
    }

    fn release(&mut self, api: &CudaApi) {
        if self.ptr != 0 {
            unsafe {
                (api.cuMemFree)(self.ptr);
            }
            self.ptr = 0;
            self.capacity = 0;
        }
    }
}

struct Session {
    api: &'static CudaApi,
    context: CUcontext,
    module: CUmodule,
    function: CUfunction,
    grey_buf: DeviceBuffer,
    out_buf: DeviceBuffer,
    dims: FrameDims,
}

// The session owns its context exclusively and re-binds it with
// `cuCtxSetCurrent` before every launch, so moving the session between
// scheduler threads is sound.
unsafe impl Send for Session {}

impl Session {
    fn create(dims: &FrameDims) -> Result<Session, AccelError> {
        let api = cuda()?;
        let device = first_device(api)?;
        let ptx = compile_ptx()?;

        let mut context: CUcontext = ptr::null_mut();
        let rc = unsafe { (api.cuCtxCreate)(&mut context, 0, device) };
        if rc != CUDA_SUCCESS {
            return Err(AccelError::Unavailable(format!(
                "cuCtxCreate failed ({})",
                rc
            )));
        }

        let mut module: CUmodule = ptr::null_mut();
        let rc = unsafe { (api.cuModuleLoadData)(&mut module, ptx.as_ptr() as *const c_void) };
        if rc != CUDA_SUCCESS {
            unsafe {
                (api.cuCtxDestroy)(context);
            }
            return Err(AccelError::LaunchFailed(rc));
        }

        let entry = CString::new("build_scanlines").expect("entry name has no NUL");
        let mut function: CUfunction = ptr::null_mut();
        let rc = unsafe { (api.cuModuleGetFunction)(&mut function, module, entry.as_ptr()) };
        if rc != CUDA_SUCCESS {
            unsafe {
                (api.cuModuleUnload)(module);
                (api.cuCtxDestroy)(context);
            }
            return Err(AccelError::LaunchFailed(rc));
        }

        debug!("CUDA session ready for {:?}", dims);
        Ok(Session {
            api,
            context,
            module,
            function,
            grey_buf: DeviceBuffer::empty(),
            out_buf: DeviceBuffer::empty(),
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

        let rc = unsafe { (api.cuCtxSetCurrent)(self.context) };
        if rc != CUDA_SUCCESS {
            return Err(AccelError::LaunchFailed(rc));
        }

        self.grey_buf.ensure(api, grey_len)?;
        self.out_buf.ensure(api, out_len)?;

        let rc = unsafe {
            (api.cuMemcpyHtoD)(self.grey_buf.ptr, grey.as_ptr() as *const c_void, grey_len)
        };
        if rc != CUDA_SUCCESS {
            return Err(AccelError::TransferFailed(rc));
        }

        let mut grey_ptr = self.grey_buf.ptr;
        let mut out_ptr = self.out_buf.ptr;
        let mut src_w = dims.src_w;
        let mut height = dims.height;
        let mut out_width = dims.out_width;
        let mut channels = dims.channels;
        let mut pad_left = dims.pad_left;
        let mut layers = layer_count;
        let mut params: [*mut c_void; 8] = [
            &mut grey_ptr as *mut CUdeviceptr as *mut c_void,
            &mut out_ptr as *mut CUdeviceptr as *mut c_void,
            &mut src_w as *mut u32 as *mut c_void,
            &mut height as *mut u32 as *mut c_void,
            &mut out_width as *mut u32 as *mut c_void,
            &mut channels as *mut u32 as *mut c_void,
            &mut pad_left as *mut u32 as *mut c_void,
            &mut layers as *mut u32 as *mut c_void,
        ];

        let grid_x = (dims.out_width + BLOCK_DIM - 1) / BLOCK_DIM;
        let grid_y = (dims.height + BLOCK_DIM - 1) / BLOCK_DIM;
        let rc = unsafe {
            (api.cuLaunchKernel)(
                self.function,
                grid_x,
                grid_y,
                layer_count,
                BLOCK_DIM,
                BLOCK_DIM,
                1,
                0,
                ptr::null_mut(),
                params.as_mut_ptr(),
                ptr::null_mut(),
            )
        };
        if rc != CUDA_SUCCESS {
            return Err(AccelError::LaunchFailed(rc));
        }

        let rc = unsafe { (api.cuCtxSynchronize)() };
        if rc != CUDA_SUCCESS {
            return Err(AccelError::LaunchFailed(rc));
        }
        let rc = unsafe {
            (api.cuMemcpyDtoH)(out.as_mut_ptr() as *mut c_void, self.out_buf.ptr, out_len)
        };
        if rc != CUDA_SUCCESS {
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
        unsafe {
            (api.cuCtxSetCurrent)(self.context);
        }
        self.grey_buf.release(api);
        self.out_buf.release(api);
        unsafe {
            (api.cuModuleUnload)(self.module);
            (api.cuCtxDestroy)(self.context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lith_core::profile::TargetProfile;
    use lith_core::scanline;

    /// Runs only on machines with a CUDA device and NVRTC; asserts the
    /// kernel equivalence contract against the CPU path.
    #[test]
    fn kernel_matches_cpu_path_when_device_present() {
        let backend = Backend::new();
        if !backend.available() || backend.probe().is_err() {
            eprintln!("skipping: no CUDA device");
            return;
        }
        let profile = TargetProfile::rgb8("t", 33, 50.0, 0.0);
        let dims = FrameDims::new(90, 21, &profile);
        let grey: Vec<u8> = (0..dims.grey_len() * 2).map(|i| (i % 239) as u8).collect();
        let mut cpu = vec![0u8; dims.scanline_len() * 2];
        for i in 0..2 {
            scanline::build_into(
                &grey[i * dims.grey_len()..(i + 1) * dims.grey_len()],
                &dims,
                &mut cpu[i * dims.scanline_len()..(i + 1) * dims.scanline_len()],
            );
        }
        let mut session = backend.open(&dims).unwrap();
        let mut gpu = vec![0u8; dims.scanline_len() * 2];
        session.batch_build_scanlines(&grey, 2, &mut gpu).unwrap();
        assert_eq!(cpu, gpu);
    }
}
