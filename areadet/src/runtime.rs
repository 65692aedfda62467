use anyhow::{Context, Result};
use areadet_core::task_pool::{PoolStats, TaskPool, TaskPoolConfig, TaskPoolHandle};

/// 进程级的任务池服务
///
/// 显式创建、显式关闭，不使用全局单例。
/// 观察者通过 `pool()` 拿到的句柄把耗时工作 (保存、处理) 移出通知路径。
#[derive(Debug)]
pub struct Runtime {
    pool: TaskPool,
}

impl Runtime {
    pub fn new(config: TaskPoolConfig) -> Result<Self> {
        let workers = config.workers;
        let pool = TaskPool::new(config)
            .with_context(|| format!("Failed to start task pool with {} workers", workers))?;
        Ok(Self { pool })
    }

    /// 默认配置，工作线程数可由 `AREADET_POOL_WORKERS` 覆盖
    pub fn from_env() -> Result<Self> {
        Self::new(TaskPoolConfig::from_env()?)
    }

    pub fn pool(&self) -> TaskPoolHandle {
        self.pool.handle()
    }

    /// 阻塞直到所有已提交的任务完成
    pub fn wait(&self) {
        self.pool.wait()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// 执行完排队中的任务后关闭
    pub fn shutdown(mut self) {
        self.pool.shutdown();
    }
}
