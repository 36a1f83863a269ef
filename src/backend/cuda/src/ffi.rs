//! Minimal CUDA driver-API and NVRTC bindings, resolved at runtime.
//!
//! The driver library ships with the GPU driver (`libcuda.so.1` /
//! `nvcuda.dll`); NVRTC ships with the toolkit or as a redistributable.
//! Either being absent simply makes the backend unavailable.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::os::raw::{c_char, c_int, c_uint, c_void};

use libloading::Library;

pub type CUresult = c_int;
pub type CUdevice = c_int;
pub type CUcontext = *mut c_void;
pub type CUmodule = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUdeviceptr = u64;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: c_int = 75;

pub type nvrtcResult = c_int;
pub type nvrtcProgram = *mut c_void;

pub const NVRTC_SUCCESS: nvrtcResult = 0;

type PFN_cuInit = unsafe extern "C" fn(c_uint) -> CUresult;
type PFN_cuDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> CUresult;
type PFN_cuDeviceGet = unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult;
type PFN_cuDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, CUdevice) -> CUresult;
type PFN_cuDeviceTotalMem = unsafe extern "C" fn(*mut usize, CUdevice) -> CUresult;
type PFN_cuDeviceGetAttribute = unsafe extern "C" fn(*mut c_int, c_int, CUdevice) -> CUresult;
type PFN_cuCtxCreate = unsafe extern "C" fn(*mut CUcontext, c_uint, CUdevice) -> CUresult;
type PFN_cuCtxDestroy = unsafe extern "C" fn(CUcontext) -> CUresult;
type PFN_cuCtxSetCurrent = unsafe extern "C" fn(CUcontext) -> CUresult;
type PFN_cuCtxSynchronize = unsafe extern "C" fn() -> CUresult;
type PFN_cuModuleLoadData = unsafe extern "C" fn(*mut CUmodule, *const c_void) -> CUresult;
type PFN_cuModuleUnload = unsafe extern "C" fn(CUmodule) -> CUresult;
type PFN_cuModuleGetFunction =
    unsafe extern "C" fn(*mut CUfunction, CUmodule, *const c_char) -> CUresult;
type PFN_cuMemAlloc = unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUresult;
type PFN_cuMemFree = unsafe extern "C" fn(CUdeviceptr) -> CUresult;
type PFN_cuMemcpyHtoD = unsafe extern "C" fn(CUdeviceptr, *const c_void, usize) -> CUresult;
type PFN_cuMemcpyDtoH = unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize) -> CUresult;
type PFN_cuLaunchKernel = unsafe extern "C" fn(
    CUfunction,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    CUstream,
    *mut *mut c_void,
    *mut *mut c_void,
) -> CUresult;

type PFN_nvrtcCreateProgram = unsafe extern "C" fn(
    *mut nvrtcProgram,
    *const c_char,
    *const c_char,
    c_int,
    *const *const c_char,
    *const *const c_char,
) -> nvrtcResult;
type PFN_nvrtcCompileProgram =
    unsafe extern "C" fn(nvrtcProgram, c_int, *const *const c_char) -> nvrtcResult;
type PFN_nvrtcGetPTXSize = unsafe extern "C" fn(nvrtcProgram, *mut usize) -> nvrtcResult;
type PFN_nvrtcGetPTX = unsafe extern "C" fn(nvrtcProgram, *mut c_char) -> nvrtcResult;
type PFN_nvrtcGetProgramLogSize = unsafe extern "C" fn(nvrtcProgram, *mut usize) -> nvrtcResult;
type PFN_nvrtcGetProgramLog = unsafe extern "C" fn(nvrtcProgram, *mut c_char) -> nvrtcResult;
type PFN_nvrtcDestroyProgram = unsafe extern "C" fn(*mut nvrtcProgram) -> nvrtcResult;

/// Resolved driver entry points. Several symbols carry a `_v2` suffix in
/// current drivers; the loader asks for those and falls back to the plain
/// name for ancient ones.
pub struct CudaApi {
    _lib: Library,
    pub cuInit: PFN_cuInit,
    pub cuDeviceGetCount: PFN_cuDeviceGetCount,
    pub cuDeviceGet: PFN_cuDeviceGet,
    pub cuDeviceGetName: PFN_cuDeviceGetName,
    pub cuDeviceTotalMem: PFN_cuDeviceTotalMem,
    pub cuDeviceGetAttribute: PFN_cuDeviceGetAttribute,
    pub cuCtxCreate: PFN_cuCtxCreate,
    pub cuCtxDestroy: PFN_cuCtxDestroy,
    pub cuCtxSetCurrent: PFN_cuCtxSetCurrent,
    pub cuCtxSynchronize: PFN_cuCtxSynchronize,
    pub cuModuleLoadData: PFN_cuModuleLoadData,
    pub cuModuleUnload: PFN_cuModuleUnload,
    pub cuModuleGetFunction: PFN_cuModuleGetFunction,
    pub cuMemAlloc: PFN_cuMemAlloc,
    pub cuMemFree: PFN_cuMemFree,
    pub cuMemcpyHtoD: PFN_cuMemcpyHtoD,
    pub cuMemcpyDtoH: PFN_cuMemcpyDtoH,
    pub cuLaunchKernel: PFN_cuLaunchKernel,
}

/// Resolved NVRTC entry points.
pub struct NvrtcApi {
    _lib: Library,
    pub nvrtcCreateProgram: PFN_nvrtcCreateProgram,
    pub nvrtcCompileProgram: PFN_nvrtcCompileProgram,
    pub nvrtcGetPTXSize: PFN_nvrtcGetPTXSize,
    pub nvrtcGetPTX: PFN_nvrtcGetPTX,
    pub nvrtcGetProgramLogSize: PFN_nvrtcGetProgramLogSize,
    pub nvrtcGetProgramLog: PFN_nvrtcGetProgramLog,
    pub nvrtcDestroyProgram: PFN_nvrtcDestroyProgram,
}

unsafe fn resolve_either<T: Copy>(lib: &Library, v2: &str, v1: &str) -> Result<T, String> {
    let v2_name = format!("{}\0", v2);
    if let Ok(sym) = lib.get::<T>(v2_name.as_bytes()) {
        return Ok(*sym);
    }
    let v1_name = format!("{}\0", v1);
    lib.get::<T>(v1_name.as_bytes())
        .map(|sym| *sym)
        .map_err(|e| format!("missing symbol {}: {}", v1, e))
}

impl CudaApi {
    pub fn load() -> Result<CudaApi, String> {
        let lib = open_library(if cfg!(target_os = "windows") {
            &["nvcuda.dll"]
        } else {
            &["libcuda.so.1", "libcuda.so"]
        })?;
        macro_rules! resolve {
            ($name:ident: $ty:ty) => {
                unsafe {
                    resolve_either::<$ty>(
                        &lib,
                        concat!(stringify!($name), "_v2"),
                        stringify!($name),
                    )?
                }
            };
        }
        let api = CudaApi {
            cuInit: resolve!(cuInit: PFN_cuInit),
            cuDeviceGetCount: resolve!(cuDeviceGetCount: PFN_cuDeviceGetCount),
            cuDeviceGet: resolve!(cuDeviceGet: PFN_cuDeviceGet),
            cuDeviceGetName: resolve!(cuDeviceGetName: PFN_cuDeviceGetName),
            cuDeviceTotalMem: resolve!(cuDeviceTotalMem: PFN_cuDeviceTotalMem),
            cuDeviceGetAttribute: resolve!(cuDeviceGetAttribute: PFN_cuDeviceGetAttribute),
            cuCtxCreate: resolve!(cuCtxCreate: PFN_cuCtxCreate),
            cuCtxDestroy: resolve!(cuCtxDestroy: PFN_cuCtxDestroy),
            cuCtxSetCurrent: resolve!(cuCtxSetCurrent: PFN_cuCtxSetCurrent),
            cuCtxSynchronize: resolve!(cuCtxSynchronize: PFN_cuCtxSynchronize),
            cuModuleLoadData: resolve!(cuModuleLoadData: PFN_cuModuleLoadData),
            cuModuleUnload: resolve!(cuModuleUnload: PFN_cuModuleUnload),
            cuModuleGetFunction: resolve!(cuModuleGetFunction: PFN_cuModuleGetFunction),
            cuMemAlloc: resolve!(cuMemAlloc: PFN_cuMemAlloc),
            cuMemFree: resolve!(cuMemFree: PFN_cuMemFree),
            cuMemcpyHtoD: resolve!(cuMemcpyHtoD: PFN_cuMemcpyHtoD),
            cuMemcpyDtoH: resolve!(cuMemcpyDtoH: PFN_cuMemcpyDtoH),
            cuLaunchKernel: resolve!(cuLaunchKernel: PFN_cuLaunchKernel),
            _lib: lib,
        };
        Ok(api)
    }
}

impl NvrtcApi {
    pub fn load() -> Result<NvrtcApi, String> {
        let lib = open_library(if cfg!(target_os = "windows") {
            &[
                "nvrtc64_120_0.dll",
                "nvrtc64_112_0.dll",
                "nvrtc64_111_0.dll",
                "nvrtc64_110_0.dll",
            ]
        } else {
            &["libnvrtc.so", "libnvrtc.so.12", "libnvrtc.so.11.2"]
        })?;
        macro_rules! resolve {
            ($name:ident: $ty:ty) => {
                unsafe {
                    *lib.get::<$ty>(concat!(stringify!($name), "\0").as_bytes())
                        .map_err(|e| format!("missing symbol {}: {}", stringify!($name), e))?
                }
            };
        }
        let api = NvrtcApi {
            nvrtcCreateProgram: resolve!(nvrtcCreateProgram: PFN_nvrtcCreateProgram),
            nvrtcCompileProgram: resolve!(nvrtcCompileProgram: PFN_nvrtcCompileProgram),
            nvrtcGetPTXSize: resolve!(nvrtcGetPTXSize: PFN_nvrtcGetPTXSize),
            nvrtcGetPTX: resolve!(nvrtcGetPTX: PFN_nvrtcGetPTX),
            nvrtcGetProgramLogSize: resolve!(nvrtcGetProgramLogSize: PFN_nvrtcGetProgramLogSize),
            nvrtcGetProgramLog: resolve!(nvrtcGetProgramLog: PFN_nvrtcGetProgramLog),
            nvrtcDestroyProgram: resolve!(nvrtcDestroyProgram: PFN_nvrtcDestroyProgram),
            _lib: lib,
        };
        Ok(api)
    }
}

fn open_library(candidates: &[&str]) -> Result<Library, String> {
    let mut last_error = String::new();
    for name in candidates {
        match unsafe { Library::new(name) } {
            Ok(lib) => return Ok(lib),
            Err(e) => last_error = format!("{}: {}", name, e),
        }
    }
    Err(last_error)
}
