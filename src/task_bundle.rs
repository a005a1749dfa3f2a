//! A minimal structured-concurrency helper: a named set of long-running
//! tasks that are all joined together on shutdown.

use async_std::task::JoinHandle;
use std::future::Future;

pub struct TaskBundle {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskBundle {
    pub fn new() -> Self {
        TaskBundle { handles: Vec::new() }
    }

    pub fn add<F>(&mut self, name: &'static str, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push((name, async_std::task::spawn(f)));
    }

    pub async fn join(self) {
        for (name, handle) in self.handles {
            log::debug!("waiting for task '{}' to finish", name);
            handle.await;
        }
    }
}
