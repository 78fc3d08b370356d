use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 串行队列：同一时刻只执行一个操作，创建时处于挂起状态
///
/// 任务最终完成后调用 [`SerialQueue::release`]，之前排队的后续操作按提交顺序依次执行；
/// 释放后提交的操作直接排到末尾。释放是单向的，不会再次挂起。
pub(crate) struct SerialQueue {
    jobs: mpsc::UnboundedSender<Job>,
    gate: watch::Sender<bool>,
}

impl SerialQueue {
    pub(crate) fn new(runtime: &Handle) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let (gate, mut gate_rx) = watch::channel(false);
        runtime.spawn(async move {
            // 队列在释放前被丢弃时，排队的操作随之丢弃
            if gate_rx.wait_for(|open| *open).await.is_err() {
                return;
            }
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { jobs, gate }
    }

    pub(crate) fn add<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.jobs.send(Box::new(job)).is_err() {
            log::warn!("串行队列已关闭，丢弃后续操作");
        }
    }

    pub(crate) fn release(&self) {
        self.gate.send_replace(true);
    }

    pub(crate) fn is_suspended(&self) -> bool {
        !*self.gate.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_jobs_wait_for_release() {
        let queue = SerialQueue::new(&Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            queue.add(move || log.lock().unwrap().push(i));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.is_suspended());
        assert!(log.lock().unwrap().is_empty());

        queue.release();
        let (tx, rx) = oneshot::channel();
        queue.add(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(!queue.is_suspended());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let queue = SerialQueue::new(&Handle::current());
        queue.release();
        queue.release();
        let (tx, rx) = oneshot::channel();
        queue.add(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
}
