use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{DetectorError, Result};

/// 聚合多块采集卡的 "Meta" 设备编号
pub const META_DEV: u32 = 255;

/// 设备基本信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 唯一硬件 ID (e.g. "sim:0", "espia:1")
    pub id: String,

    /// 对用户友好的型号名称
    pub model: String,

    /// 设备族标识 (e.g. "Simulation", "Espia")
    pub family: String,

    /// 板卡编号，META_DEV 表示聚合设备
    pub board: u32,
}

/// 厂商驱动打开后的原始设备
///
/// 只能通过 `DeviceHandle::acq_lock()` 访问。
pub trait RawDevice: Send + 'static {
    fn info(&self) -> DeviceInfo;

    /// 释放底层句柄 (fd, DMA 映射等)
    fn close(&mut self);
}

/// 物理设备句柄 + 采集互斥锁
///
/// 句柄由 DeviceHandle 独占，外部只能借用 (通常通过 `Arc<DeviceHandle<D>>` 共享)。
/// 所有接触硬件的控制操作都必须在 `acq_lock()` 返回的守卫存活期间完成。
pub struct DeviceHandle<D: RawDevice> {
    info: DeviceInfo,
    dev: Mutex<Option<D>>,
}

impl<D: RawDevice> DeviceHandle<D> {
    /// 打开设备，`opener` 是厂商相关的打开逻辑
    pub fn open<F>(id: &str, opener: F) -> Result<Self>
    where
        F: FnOnce(&str) -> Option<D>,
    {
        let dev = opener(id).ok_or_else(|| DetectorError::DeviceNotFound(id.to_string()))?;
        let info = dev.info();
        tracing::info!(target: "areadet::device", "Device opened: {} ({})", info.id, info.model);
        Ok(Self {
            info,
            dev: Mutex::new(Some(dev)),
        })
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_meta(&self) -> bool {
        self.info.board == META_DEV
    }

    pub fn is_open(&self) -> bool {
        self.dev.lock().is_some()
    }

    /// 获取采集锁
    ///
    /// 守卫在任何退出路径上 (包括 `?` 提前返回) 都会释放锁。
    /// 锁不可重入：同一线程嵌套调用会死锁。
    pub fn acq_lock(&self) -> Result<AcqLock<'_, D>> {
        let guard = self.dev.lock();
        if guard.is_none() {
            return Err(DetectorError::DeviceNotFound(format!(
                "{} (closed)",
                self.info.id
            )));
        }
        Ok(AcqLock { guard })
    }

    /// 无条件释放句柄，可以重复调用
    pub fn close(&self) {
        let mut guard = self.dev.lock();
        if let Some(mut dev) = guard.take() {
            dev.close();
            tracing::info!(target: "areadet::device", "Device closed: {}", self.info.id);
        }
    }
}

impl<D: RawDevice> Drop for DeviceHandle<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: RawDevice> fmt::Debug for DeviceHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.info.id)
            .field("model", &self.info.model)
            .field("open", &self.is_open())
            .finish()
    }
}

/// 采集锁守卫，解引用为原始设备
pub struct AcqLock<'a, D> {
    guard: MutexGuard<'a, Option<D>>,
}

impl<D> Deref for AcqLock<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        match self.guard.as_ref() {
            Some(dev) => dev,
            // acq_lock() 已检查过，锁持有期间 close() 无法执行
            None => unreachable!("AcqLock created on a closed device"),
        }
    }
}

impl<D> DerefMut for AcqLock<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        match self.guard.as_mut() {
            Some(dev) => dev,
            None => unreachable!("AcqLock created on a closed device"),
        }
    }
}

impl<D> fmt::Debug for AcqLock<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AcqLock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct Board {
        nb: u32,
        closed: Arc<AtomicUsize>,
        commands: u32,
    }

    impl RawDevice for Board {
        fn info(&self) -> DeviceInfo {
            DeviceInfo {
                id: format!("board:{}", self.nb),
                model: "TestBoard".into(),
                family: "Test".into(),
                board: self.nb,
            }
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn open_board(id: &str, closed: Arc<AtomicUsize>) -> Result<DeviceHandle<Board>> {
        DeviceHandle::open(id, |id| {
            let nb = id.strip_prefix("board:")?.parse().ok()?;
            Some(Board {
                nb,
                closed,
                commands: 0,
            })
        })
    }

    #[test]
    fn open_unknown_id_is_device_not_found() {
        let err = open_board("nope", Arc::default()).unwrap_err();
        assert!(matches!(err, DetectorError::DeviceNotFound(id) if id == "nope"));
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_locking() {
        let closed = Arc::new(AtomicUsize::new(0));
        let dev = open_board("board:0", closed.clone()).unwrap();
        assert!(!dev.is_meta());

        dev.close();
        dev.close();
        drop(dev);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let dev = open_board("board:1", Arc::default()).unwrap();
        dev.close();
        assert!(matches!(
            dev.acq_lock(),
            Err(DetectorError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn meta_device_is_detected() {
        let dev = open_board(&format!("board:{}", META_DEV), Arc::default()).unwrap();
        assert!(dev.is_meta());
    }

    #[test]
    fn acq_lock_serializes_commands() {
        let dev = Arc::new(open_board("board:2", Arc::default()).unwrap());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let dev = dev.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut lock = dev.acq_lock().unwrap();
                        // 非原子的读-改-写，只有互斥时结果才正确
                        let n = lock.commands;
                        lock.commands = n + 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(dev.acq_lock().unwrap().commands, 8000);
    }
}
