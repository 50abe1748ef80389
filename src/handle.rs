//! Owned engine handles.
//!
//! [`Owned<K>`] holds one raw handle of kind `K` and the driver that created
//! it. It is move-only; dropping it calls the kind's release function exactly
//! once. A failing release means the engine state can no longer be reasoned
//! about and is fatal.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::driver::{Driver, RawConvolution, RawEngine, RawFilter, RawTensor};
use crate::error::{fatal, EngineResult};

/// A kind of engine handle and how to release it.
pub trait HandleKind {
    type Raw: Copy + fmt::Debug;

    /// Used in diagnostics.
    const NAME: &'static str;

    fn release(driver: &dyn Driver, raw: Self::Raw) -> EngineResult<()>;
}

pub enum EngineKind {}
pub enum TensorKind {}
pub enum FilterKind {}
pub enum ConvolutionKind {}

impl HandleKind for EngineKind {
    type Raw = RawEngine;
    const NAME: &'static str = "engine handle";

    fn release(driver: &dyn Driver, raw: RawEngine) -> EngineResult<()> {
        driver.destroy_engine(raw)
    }
}

impl HandleKind for TensorKind {
    type Raw = RawTensor;
    const NAME: &'static str = "tensor descriptor";

    fn release(driver: &dyn Driver, raw: RawTensor) -> EngineResult<()> {
        driver.destroy_tensor_descriptor(raw)
    }
}

impl HandleKind for FilterKind {
    type Raw = RawFilter;
    const NAME: &'static str = "filter descriptor";

    fn release(driver: &dyn Driver, raw: RawFilter) -> EngineResult<()> {
        driver.destroy_filter_descriptor(raw)
    }
}

impl HandleKind for ConvolutionKind {
    type Raw = RawConvolution;
    const NAME: &'static str = "convolution descriptor";

    fn release(driver: &dyn Driver, raw: RawConvolution) -> EngineResult<()> {
        driver.destroy_convolution_descriptor(raw)
    }
}

/// Exclusive owner of one engine handle.
pub struct Owned<K: HandleKind> {
    raw: K::Raw,
    driver: Arc<dyn Driver>,
    _kind: PhantomData<K>,
}

impl<K: HandleKind> Owned<K> {
    /// Take ownership of `raw`, which `driver` just created.
    pub fn acquire(driver: Arc<dyn Driver>, raw: K::Raw) -> Self {
        Self { raw, driver, _kind: PhantomData }
    }

    pub fn get(&self) -> K::Raw {
        self.raw
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

impl<K: HandleKind> Drop for Owned<K> {
    fn drop(&mut self) {
        if let Err(status) = K::release(self.driver.as_ref(), self.raw) {
            fatal!("failed to release {} {:?}: engine error '{}'", K::NAME, self.raw, status);
        }
    }
}

impl<K: HandleKind> fmt::Debug for Owned<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned")
            .field("kind", &K::NAME)
            .field("raw", &self.raw)
            .finish()
    }
}

/// Owned engine context.
pub type EngineHandle = Owned<EngineKind>;

/// Create an engine context on `driver`.
pub fn create_engine_handle(driver: &Arc<dyn Driver>) -> EngineResult<EngineHandle> {
    let raw = driver.create_engine()?;
    Ok(EngineHandle::acquire(Arc::clone(driver), raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_driver::HostDriver;

    #[test]
    fn test_release_on_drop() {
        let host = Arc::new(HostDriver::new());
        let driver: Arc<dyn Driver> = host.clone();
        {
            let raw = driver.create_tensor_descriptor().unwrap();
            let _owned = Owned::<TensorKind>::acquire(Arc::clone(&driver), raw);
            assert_eq!(host.live_descriptors(), 1);
        }
        assert_eq!(host.live_descriptors(), 0);
    }

    #[test]
    fn test_move_transfers_ownership() {
        let host = Arc::new(HostDriver::new());
        let driver: Arc<dyn Driver> = host.clone();
        let make = || {
            let raw = driver.create_filter_descriptor().unwrap();
            Owned::<FilterKind>::acquire(Arc::clone(&driver), raw)
        };
        let first = make();
        let moved = first;
        assert_eq!(host.live_descriptors(), 1);
        drop(moved);
        assert_eq!(host.live_descriptors(), 0);
    }

    #[test]
    fn test_engine_handle() {
        let host = Arc::new(HostDriver::new());
        let driver: Arc<dyn Driver> = host.clone();
        let handle = create_engine_handle(&driver).unwrap();
        assert_eq!(host.live_engines(), 1);
        drop(handle);
        assert_eq!(host.live_engines(), 0);
    }

    #[test]
    #[should_panic(expected = "failed to release convolution descriptor")]
    fn test_release_failure_is_fatal() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new());
        // A handle the engine never issued cannot be released.
        let _owned = Owned::<ConvolutionKind>::acquire(driver, RawConvolution(0xdead));
    }
}
