//! Per-session serial task filter
//!
//! Requests of one session are admitted one at a time, in arrival order. Each
//! session gets a worker task draining a FIFO of admission slots; a request
//! waits for its slot, runs, and marks itself done, which opens the next slot.
//!
//! Both waits are bounded by the same timeout. A request not admitted in time
//! is abandoned with an error log. A request that runs past the timeout loses
//! its slot so the queue keeps moving, and its result is replaced with
//! [`SerialError::RequestTimeout`] unless it already failed on its own.

use crate::error::SerialError;
use crate::session::SessionId;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

struct Job {
    route: String,
    admit: oneshot::Sender<SerialTask>,
}

#[derive(Debug)]
pub struct SerialFilter {
    timeout: Duration,
    queues: HashMap<SessionId, mpsc::UnboundedSender<Job>>,
}

impl SerialFilter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            queues: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of sessions with a live queue.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Queues a request of `sid` behind every earlier one of the same session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&mut self, sid: SessionId, route: &str) -> PendingTask {
        let (admit, admitted) = oneshot::channel();
        let mut job = Job {
            route: route.to_string(),
            admit,
        };

        if let Some(queue) = self.queues.get(&sid) {
            match queue.send(job) {
                Ok(()) => return self.pending(sid, route, admitted),
                // Worker finished, start a fresh one
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_queue(sid, rx, self.timeout));
        if tx.send(job).is_err() {
            error!("[serial filter] queue for session {} closed on creation", sid);
        }
        self.queues.insert(sid, tx);
        self.pending(sid, route, admitted)
    }

    fn pending(&self, sid: SessionId, route: &str, admit: oneshot::Receiver<SerialTask>) -> PendingTask {
        PendingTask {
            sid,
            route: route.to_string(),
            deadline: time::Instant::now() + self.timeout,
            admit,
        }
    }

    /// Drops the session's queue once it drains. Called when the session
    /// closes.
    pub fn release(&mut self, sid: SessionId) -> bool {
        self.queues.remove(&sid).is_some()
    }
}

async fn drain_queue(sid: SessionId, mut jobs: mpsc::UnboundedReceiver<Job>, timeout: Duration) {
    while let Some(job) = jobs.recv().await {
        let (done_tx, done_rx) = oneshot::channel();
        let task = SerialTask {
            sid,
            route: job.route.clone(),
            done: Some(done_tx),
        };

        if job.admit.send(task).is_err() {
            debug!(
                "[serial filter] {} of session {} abandoned before admission",
                job.route, sid
            );
            continue;
        }

        // A dropped task counts as done
        if time::timeout(timeout, done_rx).await.is_err() {
            warn!(
                "[serial filter] {} of session {} still running after {:?}, releasing queue",
                job.route, sid, timeout
            );
        }
    }
    debug!("[serial filter] queue of session {} drained", sid);
}

/// A request waiting for its turn.
#[derive(Debug)]
pub struct PendingTask {
    sid: SessionId,
    route: String,
    /// Admission deadline, counted from enqueue
    deadline: time::Instant,
    admit: oneshot::Receiver<SerialTask>,
}

impl PendingTask {
    pub async fn admitted(self) -> Result<SerialTask, SerialError> {
        match time::timeout_at(self.deadline, self.admit).await {
            Ok(Ok(task)) => Ok(task),
            _ => {
                error!(
                    "[serial filter] msg timeout, route: {}, sid: {}",
                    self.route, self.sid
                );
                Err(SerialError::RequestTimeout {
                    sid: self.sid,
                    route: self.route,
                })
            }
        }
    }

    /// Waits for admission, runs `handler`, and marks the task done.
    pub async fn run<F, T, E>(self, handler: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<SerialError>,
    {
        let mut task = self.admitted().await?;
        let result = handler.await;

        if !task.done() && result.is_ok() {
            return Err(task.timeout_error().into());
        }
        result
    }
}

/// The admitted request. Holding it keeps the session's queue closed.
#[derive(Debug)]
pub struct SerialTask {
    sid: SessionId,
    route: String,
    done: Option<oneshot::Sender<()>>,
}

impl SerialTask {
    pub fn sid(&self) -> SessionId {
        self.sid
    }

    /// Opens the queue for the next request. Returns false if the task had
    /// already been released by its timeout.
    pub fn done(&mut self) -> bool {
        match self.done.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn timeout_error(&self) -> SerialError {
        SerialError::RequestTimeout {
            sid: self.sid,
            route: self.route.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use std::sync::{Arc, Mutex};
    use tokio::time::sleep;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn test_requests_of_one_session_run_in_order() {
        let mut filter = SerialFilter::new(TIMEOUT);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (i, delay) in [30u64, 10, 20].into_iter().enumerate() {
            let pending = filter.enqueue(1, "area.move");
            let log = log.clone();
            handles.push(tokio::spawn(pending.run(async move {
                log.lock().unwrap().push(format!("start {}", i));
                sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(format!("end {}", i));
                Ok::<_, SerialError>(i)
            })));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i);
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_do_not_block_each_other() {
        let mut filter = SerialFilter::new(TIMEOUT);

        let _held = filter.enqueue(1, "a").admitted().await.unwrap();
        let other = filter.enqueue(2, "b");
        let started = time::Instant::now();
        let task = other.admitted().await.unwrap();

        assert_eq!(task.sid(), 2);
        assert!(started.elapsed() < TIMEOUT);
        assert_eq!(filter.queue_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_timeout() {
        let mut filter = SerialFilter::new(TIMEOUT);

        let first = filter.enqueue(1, "a").admitted().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        let second = filter.enqueue(1, "b");
        let third = filter.enqueue(1, "c");

        // first is released by its timeout at 100ms, second holds until 200ms
        let second = tokio_test::assert_ok!(second.admitted().await);
        assert_eq!(
            tokio_test::assert_err!(third.admitted().await),
            SerialError::RequestTimeout {
                sid: 1,
                route: "c".into()
            }
        );
        drop(first);
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_reports_timeout_and_releases_queue() {
        let mut filter = SerialFilter::new(TIMEOUT);

        let slow = tokio::spawn(filter.enqueue(1, "slow").run(async {
            sleep(Duration::from_millis(250)).await;
            Ok::<_, SerialError>(())
        }));
        sleep(Duration::from_millis(10)).await;
        let next = filter.enqueue(1, "next");
        let next = tokio::spawn(next.run(async { Ok::<_, SerialError>(time::Instant::now()) }));

        let next_started = next.await.unwrap().unwrap();
        assert!(matches!(
            slow.await.unwrap(),
            Err(SerialError::RequestTimeout { sid: 1, .. })
        ));
        // the queue moved on before the slow handler finished
        assert!(next_started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_wins_over_timeout() {
        let mut filter = SerialFilter::new(TIMEOUT);

        let result = filter
            .enqueue(1, "bag.use")
            .run(async {
                sleep(Duration::from_millis(150)).await;
                Err::<(), _>(HandlerError::Rejected("no such item".into()))
            })
            .await;

        assert!(matches!(result, Err(HandlerError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_task_opens_queue() {
        let mut filter = SerialFilter::new(TIMEOUT);

        let first = filter.enqueue(1, "a").admitted().await.unwrap();
        let second = filter.enqueue(1, "b");
        drop(first);

        let started = time::Instant::now();
        let mut task = second.admitted().await.unwrap();
        assert!(started.elapsed() < TIMEOUT);
        assert!(task.done());
        assert!(!task.done());
    }

    #[tokio::test]
    async fn test_release_and_requeue() {
        let mut filter = SerialFilter::new(TIMEOUT);
        filter.enqueue(3, "a").admitted().await.unwrap().done();

        assert!(filter.release(3));
        assert!(!filter.release(3));
        assert_eq!(filter.queue_count(), 0);

        let mut task = filter.enqueue(3, "b").admitted().await.unwrap();
        assert!(task.done());
        assert_eq!(filter.queue_count(), 1);
    }
}
