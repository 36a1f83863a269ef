//! Dummy accelerator backend to exercise router and pipeline fallback code
//! outside of a machine with real GPU drivers.
//!
//! The session delegates to the core's CPU scanline path, so a run routed
//! through this backend produces exactly the bytes the CPU pipeline would —
//! which is what makes it useful for the determinism and fallback tests.
//! Failure injection covers each stage the router has policy for.

#[macro_use]
extern crate log;

use lith_core::accel::{
    AccelError, AccelKind, Accelerator, AcceleratorInfo, AcceleratorSession, FrameDims,
};
use lith_core::scanline;

/// Which stage of the backend should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureMode {
    /// Fully functional.
    None,
    /// `available()` reports false.
    Probe,
    /// Session creation fails.
    Open,
    /// Every kernel launch fails.
    Launch,
}

/// Dummy backend impersonating a configurable accelerator.
pub struct Backend {
    kind: AccelKind,
    vram_bytes: u64,
    has_tensor_cores: bool,
    failure: FailureMode,
}

impl Default for Backend {
    fn default() -> Backend {
        Backend::new()
    }
}

impl Backend {
    /// A healthy fake OpenCL device with 8 GiB of memory.
    pub fn new() -> Backend {
        Backend {
            kind: AccelKind::OpenCl,
            vram_bytes: 8 << 30,
            has_tensor_cores: false,
            failure: FailureMode::None,
        }
    }

    /// Impersonate a different backend kind.
    pub fn with_kind(mut self, kind: AccelKind) -> Backend {
        self.kind = kind;
        self
    }

    /// Report a different memory size.
    pub fn with_vram(mut self, bytes: u64) -> Backend {
        self.vram_bytes = bytes;
        self
    }

    /// Report tensor cores, promoting a fake CUDA device in auto selection.
    pub fn with_tensor_cores(mut self, present: bool) -> Backend {
        self.has_tensor_cores = present;
        self
    }

    /// Inject a failure at the given stage.
    pub fn failing(mut self, mode: FailureMode) -> Backend {
        self.failure = mode;
        self
    }
}

impl Accelerator for Backend {
    fn kind(&self) -> AccelKind {
        self.kind
    }

    fn available(&self) -> bool {
        self.failure != FailureMode::Probe
    }

    fn probe(&self) -> Result<AcceleratorInfo, AccelError> {
        if self.failure == FailureMode::Probe {
            return Err(AccelError::Unavailable("probe disabled".into()));
        }
        Ok(AcceleratorInfo {
            device_name: format!("dummy-{}", self.kind),
            vram_bytes: self.vram_bytes,
            has_tensor_cores: self.has_tensor_cores,
        })
    }

    fn open(&self, dims: &FrameDims) -> Result<Box<dyn AcceleratorSession>, AccelError> {
        if self.failure == FailureMode::Open {
            return Err(AccelError::Unavailable("open disabled".into()));
        }
        debug!("dummy-{}: opening session for {:?}", self.kind, dims);
        Ok(Box::new(Session {
            dims: *dims,
            fail_launches: self.failure == FailureMode::Launch,
        }))
    }
}

struct Session {
    dims: FrameDims,
    fail_launches: bool,
}

impl AcceleratorSession for Session {
    fn build_scanlines(&mut self, grey: &[u8], out: &mut [u8]) -> Result<(), AccelError> {
        if self.fail_launches {
            return Err(AccelError::LaunchFailed(-1));
        }
        scanline::build_into(grey, &self.dims, out);
        Ok(())
    }

    fn batch_build_scanlines(
        &mut self,
        grey: &[u8],
        layer_count: u32,
        out: &mut [u8],
    ) -> Result<(), AccelError> {
        if self.fail_launches {
            return Err(AccelError::LaunchFailed(-1));
        }
        let grey_len = self.dims.grey_len();
        let scan_len = self.dims.scanline_len();
        for i in 0..layer_count as usize {
            scanline::build_into(
                &grey[i * grey_len..(i + 1) * grey_len],
                &self.dims,
                &mut out[i * scan_len..(i + 1) * scan_len],
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lith_core::profile::TargetProfile;

    fn dims() -> FrameDims {
        let profile = TargetProfile::grey3("t", 8, 50.0, 0.0);
        FrameDims::new(16, 4, &profile)
    }

    #[test]
    fn session_matches_cpu_path() {
        let dims = dims();
        let grey: Vec<u8> = (0..dims.grey_len()).map(|i| (i * 3 % 200) as u8).collect();
        let mut cpu = vec![0u8; dims.scanline_len()];
        scanline::build_into(&grey, &dims, &mut cpu);

        let mut session = Backend::new().open(&dims).unwrap();
        let mut gpu = vec![0u8; dims.scanline_len()];
        session.build_scanlines(&grey, &mut gpu).unwrap();
        assert_eq!(cpu, gpu);

        // Two-layer batch, same content in both slots.
        let mut batch_in = grey.clone();
        batch_in.extend_from_slice(&grey);
        let mut batch_out = vec![0u8; 2 * dims.scanline_len()];
        session
            .batch_build_scanlines(&batch_in, 2, &mut batch_out)
            .unwrap();
        assert_eq!(&batch_out[..dims.scanline_len()], cpu.as_slice());
        assert_eq!(&batch_out[dims.scanline_len()..], cpu.as_slice());
    }

    #[test]
    fn failure_modes_fail_where_asked() {
        let dims = dims();
        assert!(!Backend::new().failing(FailureMode::Probe).available());
        assert!(Backend::new()
            .failing(FailureMode::Open)
            .open(&dims)
            .is_err());
        let mut session = Backend::new()
            .failing(FailureMode::Launch)
            .open(&dims)
            .unwrap();
        let grey = vec![0u8; dims.grey_len()];
        let mut out = vec![0u8; dims.scanline_len()];
        assert!(matches!(
            session.build_scanlines(&grey, &mut out),
            Err(AccelError::LaunchFailed(_))
        ));
    }
}
