use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{DetectorError, Result};

/// 交给任务池的一次性工作
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 覆盖默认工作线程数的环境变量
pub const POOL_WORKERS_ENV: &str = "AREADET_POOL_WORKERS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPoolConfig {
    pub workers: usize,
    pub thread_name: String,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(2, |n| n.get()),
            thread_name: "areadet-pool".to_string(),
        }
    }
}

impl TaskPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// 默认配置，工作线程数可由 `AREADET_POOL_WORKERS` 覆盖
    pub fn from_env() -> Result<Self> {
        let config = Self::default();
        match std::env::var(POOL_WORKERS_ENV) {
            Ok(raw) => {
                let n = raw.trim().parse::<usize>().map_err(|e| {
                    DetectorError::invalid_param(
                        "workers",
                        format!("{}={:?}: {}", POOL_WORKERS_ENV, raw, e),
                    )
                })?;
                Ok(config.workers(n))
            }
            Err(_) => Ok(config),
        }
    }
}

enum Msg {
    Run(Task),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    // 已提交但尚未结束 (排队中 + 运行中)
    pending: usize,
    completed: u64,
    panicked: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    counters: Mutex<Counters>,
    idle: Condvar,
}

impl Shared {
    fn finish_one(&self, panicked: bool) {
        let mut c = self.counters.lock();
        c.pending -= 1;
        c.completed += 1;
        if panicked {
            c.panicked += 1;
        }
        if c.pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// 任务池的运行统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub pending: usize,
    pub completed: u64,
    pub panicked: u64,
}

/// 可克隆的提交端，观察者和任务内部都用它提交新任务
#[derive(Clone)]
pub struct TaskPoolHandle {
    tx: Sender<Msg>,
    shared: Arc<Shared>,
}

impl TaskPoolHandle {
    /// 提交任务，从不阻塞。任务池关闭后返回 `PoolShutdown`
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_boxed(Box::new(task))
    }

    pub fn submit_boxed(&self, task: Task) -> Result<()> {
        // 检查 closed、计数和入队都在同一把锁内完成，
        // shutdown 的 Shutdown 消息因此总是排在已接受的任务之后。无界队列的 send 不会阻塞
        let mut c = self.shared.counters.lock();
        if c.closed || self.tx.send(Msg::Run(task)).is_err() {
            return Err(DetectorError::PoolShutdown);
        }
        c.pending += 1;
        Ok(())
    }

    /// 阻塞直到队列为空且没有任务在运行 (包括运行中任务新提交的任务)
    ///
    /// 不能在任务池的工作线程里调用，否则会等待自己而死锁。
    pub fn wait(&self) {
        let mut c = self.shared.counters.lock();
        while c.pending > 0 {
            self.shared.idle.wait(&mut c);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.counters.lock().closed
    }
}

impl fmt::Debug for TaskPoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPoolHandle")
            .field("counters", &*self.shared.counters.lock())
            .finish()
    }
}

/// 固定线程数的异步任务池
///
/// 任务之间没有顺序保证，也没有超时。panic 的任务被记录后丢弃，工作线程继续运行。
pub struct TaskPool {
    handle: TaskPoolHandle,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(config: TaskPoolConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(DetectorError::invalid_param(
                "workers",
                "task pool needs at least one worker",
            ));
        }

        let (tx, rx) = unbounded::<Msg>();
        let shared = Arc::new(Shared::default());
        let mut pool = Self {
            handle: TaskPoolHandle {
                tx,
                shared: shared.clone(),
            },
            workers: Vec::with_capacity(config.workers),
        };

        for index in 0..config.workers {
            let rx = rx.clone();
            let shared = shared.clone();
            // 启动失败时 pool 被 drop，已启动的线程会被正常关闭
            let worker = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(rx, shared))?;
            pool.workers.push(worker);
        }

        tracing::info!(
            target: "areadet::pool",
            "Task pool started with {} workers",
            config.workers
        );
        Ok(pool)
    }

    pub fn handle(&self) -> TaskPoolHandle {
        self.handle.clone()
    }

    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.submit(task)
    }

    pub fn wait(&self) {
        self.handle.wait()
    }

    pub fn stats(&self) -> PoolStats {
        let c = self.handle.shared.counters.lock();
        PoolStats {
            workers: self.workers.len(),
            pending: c.pending,
            completed: c.completed,
            panicked: c.panicked,
        }
    }

    /// 停止接受新任务，执行完已排队的任务后回收工作线程。可以重复调用
    pub fn shutdown(&mut self) {
        {
            let mut c = self.handle.shared.counters.lock();
            if c.closed && self.workers.is_empty() {
                return;
            }
            c.closed = true;
            // 队列先进先出，Shutdown 排在所有已接受的任务之后
            for _ in 0..self.workers.len() {
                let _ = self.handle.tx.send(Msg::Shutdown);
            }
        }

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!(target: "areadet::pool", "Task pool worker terminated abnormally");
            }
        }
        tracing::info!(target: "areadet::pool", "Task pool shut down");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(rx: Receiver<Msg>, shared: Arc<Shared>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Run(task) => {
                let panicked = panic::catch_unwind(AssertUnwindSafe(task)).is_err();
                if panicked {
                    tracing::error!(target: "areadet::pool", "Task panicked, worker continues");
                }
                shared.finish_one(panicked);
            }
            Msg::Shutdown => break,
        }
    }
}
