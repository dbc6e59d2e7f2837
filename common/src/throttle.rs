//! Open-files limit shared by the copy workers.
//!
//! Every copy holds two descriptors (source and target) for the duration of the byte copy. With
//! hundreds of workers that can exceed the process limit, so workers take a permit before opening
//! anything. A limit of `None` (or zero) disables throttling.

#[derive(Debug, Clone, Default)]
pub struct OpenFiles {
    sem: Option<std::sync::Arc<tokio::sync::Semaphore>>,
}

pub struct OpenFileGuard {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl OpenFiles {
    #[must_use]
    pub fn new(max_open_files: Option<usize>) -> Self {
        match max_open_files {
            Some(limit) if limit > 0 => Self {
                sem: Some(std::sync::Arc::new(tokio::sync::Semaphore::new(limit))),
            },
            _ => Self { sem: None },
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self { sem: None }
    }

    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.sem.is_some()
    }

    /// Waits for a permit; the permit is released when the returned guard is dropped.
    pub async fn permit(&self) -> OpenFileGuard {
        let permit = match &self.sem {
            // the semaphore is never closed, acquire can only fail after close()
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };
        OpenFileGuard { _permit: permit }
    }

    #[must_use]
    pub fn available(&self) -> Option<usize> {
        self.sem.as_ref().map(|sem| sem.available_permits())
    }
}
