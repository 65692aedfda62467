// areadet-simulation/examples/fault_recovery.rs

use anyhow::Result;
use areadet_core::prelude::*;
use areadet_simulation::{open, FaultInjection, SimConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cam = open("sim:0", SimConfig::default())?;
    let hw = cam.hw();
    let config = AcqConfig::new()
        .nb_frames(5)
        .exp_time(0.01)
        .frame_dim(FrameDim::new(256, 256, PixelType::Bpp16));

    hw.register_frame_callback(frame_callback(|frame| {
        println!("frame {} ({} bytes)", frame.acq_frame_nb, frame.buffer.byte_len());
        Ok(true)
    }));

    // 第 2 帧读出失败
    cam.inject(FaultInjection {
        fault_at_frame: Some(2),
        ..Default::default()
    });
    hw.arm(&config)?;
    hw.start_acq()?;
    let state = hw.wait_acq_end();
    println!("ended in {:?}: {:?}", state, hw.status().last_error);

    // 软复位不能离开 Fault
    if let Err(e) = hw.reset(ResetLevel::Soft) {
        println!("soft reset refused: {}", e);
    }
    hw.reset(ResetLevel::Hard)?;
    println!("after hard reset: {:?}", hw.state());

    hw.arm(&config)?;
    hw.start_acq()?;
    println!("second run ended in {:?}", hw.wait_acq_end());
    Ok(())
}
