//! Copy worker pool.
//!
//! A fixed number of tokio tasks drain one shared request channel. Each worker runs until it
//! receives a [`Request::Quit`]; an empty channel only suspends it.

use crate::backup::Request;
use crate::throttle;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped after consuming a quit request.
    Quit,
    /// The request channel closed before a quit request arrived.
    ChannelClosed,
}

/// Called with the worker id once a worker consumed its quit request.
pub type QuitCallback = std::sync::Arc<dyn Fn(usize) + Send + Sync>;

async fn worker(
    id: usize,
    requests: async_channel::Receiver<Request>,
    open_files: throttle::OpenFiles,
    on_quit: QuitCallback,
) -> WorkerExit {
    tracing::debug!("worker {} started", id);
    loop {
        match requests.recv().await {
            Ok(Request::Copy(request)) => {
                tracing::debug!("worker {} copying {:?}", id, &request.source);
                if let Err(error) = request.handle(id, &open_files).await {
                    tracing::error!("worker {}: {:#}", id, &error);
                }
            }
            Ok(Request::Quit) => {
                tracing::debug!("worker {} quitting", id);
                on_quit(id);
                return WorkerExit::Quit;
            }
            Err(_) => {
                tracing::error!(
                    "worker {}: request channel closed without a quit request",
                    id
                );
                return WorkerExit::ChannelClosed;
            }
        }
    }
}

pub struct WorkerPool {
    join_set: tokio::task::JoinSet<WorkerExit>,
}

impl WorkerPool {
    /// Spawns `num_workers` workers on the current runtime.
    #[must_use]
    pub fn start(
        num_workers: usize,
        requests: &async_channel::Receiver<Request>,
        open_files: &throttle::OpenFiles,
        on_quit: &QuitCallback,
    ) -> Self {
        let mut join_set = tokio::task::JoinSet::new();
        for id in 0..num_workers {
            join_set.spawn(worker(
                id,
                requests.clone(),
                open_files.clone(),
                on_quit.clone(),
            ));
        }
        tracing::info!("started {} copy workers", num_workers);
        Self { join_set }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.join_set.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.join_set.is_empty()
    }

    /// Waits for every worker to stop.
    pub async fn join(mut self) -> anyhow::Result<Vec<WorkerExit>> {
        let mut exits = vec![];
        let mut panicked = 0;
        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok(exit) => exits.push(exit),
                Err(error) => {
                    tracing::error!("copy worker panicked: {}", &error);
                    panicked += 1;
                }
            }
        }
        if panicked > 0 {
            return Err(anyhow::anyhow!("{} copy workers panicked", panicked));
        }
        Ok(exits)
    }
}
