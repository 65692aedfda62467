// areadet/examples/acquire.rs

use anyhow::Result;
use areadet::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // 1. 列出可用设备
    for info in list_devices() {
        println!("Found {} ({} / {})", info.id, info.family, info.model);
    }

    // 2. 任务池运行时，工作线程数可由 AREADET_POOL_WORKERS 覆盖
    let rt = Runtime::from_env()?;
    let hw = open_detector("sim:0")?;

    // 3. 保存观察者：通知路径只做入队，真正的处理在任务池上
    let saver = Arc::new(SavingObserver::new(rt.pool(), |frame: SavedFrame| -> anyhow::Result<()> {
        let pixels = frame.data.data().chunks_exact(2);
        let count = pixels.len().max(1);
        let mean = pixels
            .map(|p| u16::from_le_bytes([p[0], p[1]]) as f64)
            .sum::<f64>()
            / count as f64;
        println!(
            "  frame {:>3}  {}x{}  mean {:8.1}  t={:?}",
            frame.acq_frame_nb,
            frame.frame_dim.width(),
            frame.frame_dim.height(),
            mean,
            frame.timestamp
        );
        Ok(())
    }));
    let saver_id = hw.register_frame_callback(saver.clone());

    // 4. 10 个缓冲区，1024x1024 16 位，3 帧
    let report = Acquisition::new(&hw)
        .config(
            AcqConfig::new()
                .nb_buffers(10)
                .frame_dim(FrameDim::new(1024, 1024, PixelType::Bpp16))
                .nb_frames(3)
                .exp_time(0.01),
        )
        .timeout(Duration::from_secs(10))
        .run()?;

    hw.unregister_frame_callback(saver_id)?;
    rt.wait();

    println!(
        "Acquisition {} finished in {:?}: {} frames, state {:?}",
        report.acq_id,
        report.elapsed,
        report.nb_frames(),
        report.end_state
    );
    println!("Saving: {:?}", saver.stats());

    rt.shutdown();
    Ok(())
}
