//! Minimal OpenCL driver bindings, resolved from the system library at
//! runtime. Only the entry points the scanline kernels need are declared;
//! the loader holds the library handle alive for as long as the function
//! pointers are in use.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::os::raw::{c_char, c_void};

use libloading::Library;

pub type cl_int = i32;
pub type cl_uint = u32;
pub type cl_ulong = u64;
pub type cl_bitfield = u64;

pub type cl_platform_id = *mut c_void;
pub type cl_device_id = *mut c_void;
pub type cl_context = *mut c_void;
pub type cl_command_queue = *mut c_void;
pub type cl_program = *mut c_void;
pub type cl_kernel = *mut c_void;
pub type cl_mem = *mut c_void;

pub const CL_SUCCESS: cl_int = 0;
pub const CL_MEM_OBJECT_ALLOCATION_FAILURE: cl_int = -4;
pub const CL_OUT_OF_RESOURCES: cl_int = -5;
pub const CL_OUT_OF_HOST_MEMORY: cl_int = -6;

pub const CL_DEVICE_TYPE_GPU: cl_bitfield = 1 << 2;
pub const CL_DEVICE_NAME: cl_uint = 0x102B;
pub const CL_DEVICE_GLOBAL_MEM_SIZE: cl_uint = 0x101F;

pub const CL_MEM_READ_ONLY: cl_bitfield = 1 << 2;
pub const CL_MEM_WRITE_ONLY: cl_bitfield = 1 << 1;

pub const CL_TRUE: cl_uint = 1;

type PFN_clGetPlatformIDs =
    unsafe extern "C" fn(cl_uint, *mut cl_platform_id, *mut cl_uint) -> cl_int;
type PFN_clGetDeviceIDs = unsafe extern "C" fn(
    cl_platform_id,
    cl_bitfield,
    cl_uint,
    *mut cl_device_id,
    *mut cl_uint,
) -> cl_int;
type PFN_clGetDeviceInfo =
    unsafe extern "C" fn(cl_device_id, cl_uint, usize, *mut c_void, *mut usize) -> cl_int;
type PFN_clCreateContext = unsafe extern "C" fn(
    *const isize,
    cl_uint,
    *const cl_device_id,
    *const c_void,
    *mut c_void,
    *mut cl_int,
) -> cl_context;
type PFN_clCreateCommandQueue =
    unsafe extern "C" fn(cl_context, cl_device_id, cl_bitfield, *mut cl_int) -> cl_command_queue;
type PFN_clCreateProgramWithSource = unsafe extern "C" fn(
    cl_context,
    cl_uint,
    *const *const c_char,
    *const usize,
    *mut cl_int,
) -> cl_program;
type PFN_clBuildProgram = unsafe extern "C" fn(
    cl_program,
    cl_uint,
    *const cl_device_id,
    *const c_char,
    *const c_void,
    *mut c_void,
) -> cl_int;
type PFN_clCreateKernel =
    unsafe extern "C" fn(cl_program, *const c_char, *mut cl_int) -> cl_kernel;
type PFN_clCreateBuffer =
    unsafe extern "C" fn(cl_context, cl_bitfield, usize, *mut c_void, *mut cl_int) -> cl_mem;
type PFN_clSetKernelArg =
    unsafe extern "C" fn(cl_kernel, cl_uint, usize, *const c_void) -> cl_int;
type PFN_clEnqueueWriteBuffer = unsafe extern "C" fn(
    cl_command_queue,
    cl_mem,
    cl_uint,
    usize,
    usize,
    *const c_void,
    cl_uint,
    *const c_void,
    *mut c_void,
) -> cl_int;
type PFN_clEnqueueReadBuffer = unsafe extern "C" fn(
    cl_command_queue,
    cl_mem,
    cl_uint,
    usize,
    usize,
    *mut c_void,
    cl_uint,
    *const c_void,
    *mut c_void,
) -> cl_int;
type PFN_clEnqueueNDRangeKernel = unsafe extern "C" fn(
    cl_command_queue,
    cl_kernel,
    cl_uint,
    *const usize,
    *const usize,
    *const usize,
    cl_uint,
    *const c_void,
    *mut c_void,
) -> cl_int;
type PFN_clFinish = unsafe extern "C" fn(cl_command_queue) -> cl_int;
type PFN_clReleaseMemObject = unsafe extern "C" fn(cl_mem) -> cl_int;
type PFN_clReleaseKernel = unsafe extern "C" fn(cl_kernel) -> cl_int;
type PFN_clReleaseProgram = unsafe extern "C" fn(cl_program) -> cl_int;
type PFN_clReleaseCommandQueue = unsafe extern "C" fn(cl_command_queue) -> cl_int;
type PFN_clReleaseContext = unsafe extern "C" fn(cl_context) -> cl_int;

/// Resolved OpenCL entry points. The `Library` field keeps the shared
/// object mapped; the function pointers are only valid while it lives.
pub struct ClApi {
    _lib: Library,
    pub clGetPlatformIDs: PFN_clGetPlatformIDs,
    pub clGetDeviceIDs: PFN_clGetDeviceIDs,
    pub clGetDeviceInfo: PFN_clGetDeviceInfo,
    pub clCreateContext: PFN_clCreateContext,
    pub clCreateCommandQueue: PFN_clCreateCommandQueue,
    pub clCreateProgramWithSource: PFN_clCreateProgramWithSource,
    pub clBuildProgram: PFN_clBuildProgram,
    pub clCreateKernel: PFN_clCreateKernel,
    pub clCreateBuffer: PFN_clCreateBuffer,
    pub clSetKernelArg: PFN_clSetKernelArg,
    pub clEnqueueWriteBuffer: PFN_clEnqueueWriteBuffer,
    pub clEnqueueReadBuffer: PFN_clEnqueueReadBuffer,
    pub clEnqueueNDRangeKernel: PFN_clEnqueueNDRangeKernel,
    pub clFinish: PFN_clFinish,
    pub clReleaseMemObject: PFN_clReleaseMemObject,
    pub clReleaseKernel: PFN_clReleaseKernel,
    pub clReleaseProgram: PFN_clReleaseProgram,
    pub clReleaseCommandQueue: PFN_clReleaseCommandQueue,
    pub clReleaseContext: PFN_clReleaseContext,
}

#[allow(non_snake_case)]
impl ClApi {
    /// Load the platform's canonical OpenCL library and resolve every entry
    /// point, or report why it cannot be done on this machine.
    pub fn load() -> Result<ClApi, String> {
        let lib = open_library()?;
        macro_rules! resolve {
            ($name:ident: $ty:ty) => {
                unsafe {
                    *lib.get::<$ty>(concat!(stringify!($name), "\0").as_bytes())
                        .map_err(|e| format!("missing symbol {}: {}", stringify!($name), e))?
                }
            };
        }
        let api = ClApi {
            clGetPlatformIDs: resolve!(clGetPlatformIDs: PFN_clGetPlatformIDs),
            clGetDeviceIDs: resolve!(clGetDeviceIDs: PFN_clGetDeviceIDs),
            clGetDeviceInfo: resolve!(clGetDeviceInfo: PFN_clGetDeviceInfo),
            clCreateContext: resolve!(clCreateContext: PFN_clCreateContext),
            clCreateCommandQueue: resolve!(clCreateCommandQueue: PFN_clCreateCommandQueue),
            clCreateProgramWithSource:
                resolve!(clCreateProgramWithSource: PFN_clCreateProgramWithSource),
            clBuildProgram: resolve!(clBuildProgram: PFN_clBuildProgram),
            clCreateKernel: resolve!(clCreateKernel: PFN_clCreateKernel),
            clCreateBuffer: resolve!(clCreateBuffer: PFN_clCreateBuffer),
            clSetKernelArg: resolve!(clSetKernelArg: PFN_clSetKernelArg),
            clEnqueueWriteBuffer: resolve!(clEnqueueWriteBuffer: PFN_clEnqueueWriteBuffer),
            clEnqueueReadBuffer: resolve!(clEnqueueReadBuffer: PFN_clEnqueueReadBuffer),
            clEnqueueNDRangeKernel: resolve!(clEnqueueNDRangeKernel: PFN_clEnqueueNDRangeKernel),
            clFinish: resolve!(clFinish: PFN_clFinish),
            clReleaseMemObject: resolve!(clReleaseMemObject: PFN_clReleaseMemObject),
            clReleaseKernel: resolve!(clReleaseKernel: PFN_clReleaseKernel),
            clReleaseProgram: resolve!(clReleaseProgram: PFN_clReleaseProgram),
            clReleaseCommandQueue: resolve!(clReleaseCommandQueue: PFN_clReleaseCommandQueue),
            clReleaseContext: resolve!(clReleaseContext: PFN_clReleaseContext),
            _lib: lib,
        };
        Ok(api)
    }
}

fn open_library() -> Result<Library, String> {
    let candidates: &[&str] = if cfg!(target_os = "windows") {
        &["OpenCL.dll"]
    } else if cfg!(target_os = "macos") {
        &["/System/Library/Frameworks/OpenCL.framework/OpenCL"]
    } else {
        &["libOpenCL.so.1", "libOpenCL.so"]
    };
    let mut last_error = String::new();
    for name in candidates {
        match unsafe { Library::new(name) } {
            Ok(lib) => return Ok(lib),
            Err(e) => last_error = format!("{}: {}", name, e),
        }
    }
    Err(last_error)
}
