use std::sync::Arc;

use crate::error::{DetectorError, Result};
use crate::geometry::{Bin, Size};
use crate::pixel_format::PixelType;
use crate::status::{AcqState, StateCell};
use crate::traits::{BinCtrl, DetInfoCtrl, SyncCtrl, TrigMode, ValidRanges};

// 通过 `HwInterface::capability` 交出去的设备族能力对象。
// 写操作只在 Ready 下放行，读操作直接转发。

fn ensure_ready(state: &StateCell, op: &'static str) -> Result<()> {
    let state = state.state();
    if state != AcqState::Ready {
        return Err(DetectorError::InvalidState { op, state });
    }
    Ok(())
}

pub(crate) struct GuardedDetInfo {
    inner: Arc<dyn DetInfoCtrl>,
    state: Arc<StateCell>,
}

impl GuardedDetInfo {
    pub(crate) fn new(inner: Arc<dyn DetInfoCtrl>, state: Arc<StateCell>) -> Self {
        Self { inner, state }
    }
}

impl DetInfoCtrl for GuardedDetInfo {
    fn max_image_size(&self) -> Result<Size> {
        self.inner.max_image_size()
    }

    fn curr_image_type(&self) -> Result<PixelType> {
        self.inner.curr_image_type()
    }

    /// 像素类型决定帧几何
    fn set_curr_image_type(&self, pixel_type: PixelType) -> Result<()> {
        ensure_ready(&self.state, "set_curr_image_type")?;
        self.inner.set_curr_image_type(pixel_type)
    }

    fn def_image_type(&self) -> Result<PixelType> {
        self.inner.def_image_type()
    }

    fn pixel_size(&self) -> Result<f64> {
        self.inner.pixel_size()
    }

    fn detector_type(&self) -> Result<String> {
        self.inner.detector_type()
    }

    fn detector_model(&self) -> Result<String> {
        self.inner.detector_model()
    }
}

pub(crate) struct GuardedSync {
    inner: Arc<dyn SyncCtrl>,
    state: Arc<StateCell>,
}

impl GuardedSync {
    pub(crate) fn new(inner: Arc<dyn SyncCtrl>, state: Arc<StateCell>) -> Self {
        Self { inner, state }
    }
}

impl SyncCtrl for GuardedSync {
    fn set_exp_time(&self, secs: f64) -> Result<()> {
        ensure_ready(&self.state, "set_exp_time")?;
        self.inner.set_exp_time(secs)
    }

    fn exp_time(&self) -> Result<f64> {
        self.inner.exp_time()
    }

    fn set_lat_time(&self, secs: f64) -> Result<()> {
        ensure_ready(&self.state, "set_lat_time")?;
        self.inner.set_lat_time(secs)
    }

    fn lat_time(&self) -> Result<f64> {
        self.inner.lat_time()
    }

    fn set_nb_frames(&self, nb_frames: u64) -> Result<()> {
        ensure_ready(&self.state, "set_nb_frames")?;
        self.inner.set_nb_frames(nb_frames)
    }

    fn nb_frames(&self) -> Result<u64> {
        self.inner.nb_frames()
    }

    fn valid_ranges(&self) -> ValidRanges {
        self.inner.valid_ranges()
    }

    fn check_trig_mode(&self, mode: TrigMode) -> bool {
        self.inner.check_trig_mode(mode)
    }

    fn set_trig_mode(&self, mode: TrigMode) -> Result<()> {
        ensure_ready(&self.state, "set_trig_mode")?;
        self.inner.set_trig_mode(mode)
    }

    fn trig_mode(&self) -> Result<TrigMode> {
        self.inner.trig_mode()
    }
}

pub(crate) struct GuardedBin {
    inner: Arc<dyn BinCtrl>,
    state: Arc<StateCell>,
}

impl GuardedBin {
    pub(crate) fn new(inner: Arc<dyn BinCtrl>, state: Arc<StateCell>) -> Self {
        Self { inner, state }
    }
}

impl BinCtrl for GuardedBin {
    /// Binning 改变有效帧几何
    fn set_bin(&self, bin: Bin) -> Result<()> {
        ensure_ready(&self.state, "set_bin")?;
        self.inner.set_bin(bin)
    }

    fn bin(&self) -> Result<Bin> {
        self.inner.bin()
    }

    fn check_bin(&self, bin: Bin) -> Result<()> {
        self.inner.check_bin(bin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Binning(Mutex<Bin>);

    impl BinCtrl for Binning {
        fn set_bin(&self, bin: Bin) -> Result<()> {
            self.check_bin(bin)?;
            *self.0.lock() = bin;
            Ok(())
        }
        fn bin(&self) -> Result<Bin> {
            Ok(*self.0.lock())
        }
        fn check_bin(&self, bin: Bin) -> Result<()> {
            if bin.x > 8 {
                return Err(DetectorError::invalid_param("bin", "too large"));
            }
            Ok(())
        }
    }

    #[test]
    fn bin_writes_only_in_ready() {
        let state = Arc::new(StateCell::new());
        let raw = Arc::new(Binning::default());
        let bin = GuardedBin::new(raw.clone(), state.clone());

        bin.set_bin(Bin::square(2)).unwrap();
        assert_eq!(raw.bin().unwrap(), Bin::square(2));

        for next in [AcqState::Armed, AcqState::Running, AcqState::Fault] {
            {
                let mut st = state.lock();
                state.transition(&mut st, next);
            }
            // 非法的因子也先报告状态错误
            for attempt in [Bin::square(4), Bin::square(16)] {
                let err = bin.set_bin(attempt).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidState);
            }
            assert_eq!(bin.bin().unwrap(), Bin::square(2));
            assert!(bin.check_bin(Bin::square(4)).is_ok());
        }
    }
}
