//! Bounds the time a directory lookup may take.
//!
//! Lookups run on a single worker thread; if it does not answer in time the
//! scan cycle gets a transient failure and moves on, and a late answer is
//! discarded. While the worker is stuck on such a lookup, later lookups fail
//! straight away: a hung backend costs one thread, not one per scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use super::{LookupError, UserDirectory, UserRecord};

/// Recommended bound for a blocking lookup
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

struct Request {
    issuer: String,
    uid: String,
    reply: mpsc::Sender<Result<UserRecord, LookupError>>,
}

/// Clears the in-flight flag once the backend returns, or panics.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TimeoutDirectory<D> {
    inner: Arc<D>,
    timeout: Duration,
    in_flight: Arc<AtomicBool>,
    /// Started on first use, and again if a backend panic took it down
    worker: Mutex<Option<mpsc::Sender<Request>>>,
}

impl<D> TimeoutDirectory<D> {
    pub fn new(inner: D, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<D> TimeoutDirectory<D>
where
    D: UserDirectory + Send + Sync + 'static,
{
    fn spawn_worker(&self) -> Result<mpsc::Sender<Request>, LookupError> {
        let (sender, requests) = mpsc::channel::<Request>();
        let inner = Arc::clone(&self.inner);
        let in_flight = Arc::clone(&self.in_flight);

        thread::Builder::new()
            .name("directory-lookup".into())
            .spawn(move || {
                for request in requests {
                    let answer = {
                        let _in_flight = InFlight(Arc::clone(&in_flight));
                        inner.lookup(&request.issuer, &request.uid)
                    };
                    // the caller is gone if it timed out already
                    let _ = request.reply.send(answer);
                }
                debug!("directory lookup worker stopped");
            })
            .map_err(|error| LookupError::Transient(format!("cannot spawn lookup: {}", error)))?;
        Ok(sender)
    }

    fn submit(&self, request: Request) -> Result<(), LookupError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let request = match worker.as_ref() {
            Some(sender) => match sender.send(request) {
                Ok(()) => return Ok(()),
                Err(mpsc::SendError(request)) => request,
            },
            None => request,
        };

        let sender = self.spawn_worker()?;
        sender
            .send(request)
            .map_err(|_| LookupError::Transient("lookup worker stopped".into()))?;
        *worker = Some(sender);
        Ok(())
    }
}

impl<D> UserDirectory for TimeoutDirectory<D>
where
    D: UserDirectory + Send + Sync + 'static,
{
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("directory still busy with a timed-out lookup");
            return Err(LookupError::Transient("previous lookup still pending".into()));
        }

        let (reply, answer) = mpsc::channel();
        let request = Request { issuer: issuer.to_owned(), uid: uid.to_owned(), reply };
        if let Err(error) = self.submit(request) {
            self.in_flight.store(false, Ordering::SeqCst);
            return Err(error);
        }

        match answer.recv_timeout(self.timeout) {
            Ok(answer) => answer,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("directory lookup timed out after {:?}", self.timeout);
                Err(LookupError::Transient(format!(
                    "lookup timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // the request died with the worker, nothing is running any more
                self.in_flight.store(false, Ordering::SeqCst);
                Err(LookupError::Transient("lookup aborted".into()))
            }
        }
    }
}
