use std::{fmt, io, sync::Arc, thread};

use seclink::ScratchConfig;
use seclink_worker::WorkerConfig;

// === Spawner === //

pub type WorkerMain = Box<dyn FnOnce() + Send>;

/// Starts the isolated context a session's dispatcher runs in.
pub trait Spawner: fmt::Debug + Send + Sync {
    /// Whether buffers can be moved into the context without copying.
    fn supports_transfer(&self) -> bool {
        true
    }

    fn spawn(
        &self,
        name: &str,
        stack_size: Option<usize>,
        main: WorkerMain,
    ) -> io::Result<thread::JoinHandle<()>>;
}

/// Runs each worker on a dedicated OS thread.
#[derive(Debug, Default)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(
        &self,
        name: &str,
        stack_size: Option<usize>,
        main: WorkerMain,
    ) -> io::Result<thread::JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(name.to_string());

        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        builder.spawn(main)
    }
}

// === SessionConfig === //

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub worker_name: String,
    pub worker_stack_size: Option<usize>,
    pub worker: WorkerConfig,
    pub spawner: Arc<dyn Spawner>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            worker_name: "seclink worker".to_string(),
            worker_stack_size: None,
            worker: WorkerConfig::default(),
            spawner: Arc::new(ThreadSpawner),
        }
    }
}

impl SessionConfig {
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn worker_stack_size(mut self, size: usize) -> Self {
        self.worker_stack_size = Some(size);
        self
    }

    pub fn max_region_bytes(mut self, max: u32) -> Self {
        self.worker.scratch = ScratchConfig {
            max_region_bytes: max,
        };
        self
    }

    pub fn spawner(mut self, spawner: impl Spawner + 'static) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }
}
