use std::fmt;
use std::sync::{Arc, Mutex};

use crate::backend::ExecutionError;

/// Caller-side binding of one (request, global rank) pairing, used to create a
/// [`RequestHandle`](crate::scheduler::RequestHandle).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankDesc {
    pub name: String,
    pub global_rank: usize,
}

pub type CompletionCallback = Box<dyn FnOnce(Result<(), ExecutionError>) + Send + 'static>;

/// One rank's runtime contribution to a collective: device buffer addresses,
/// the element count, and the continuation to fire once the collective
/// finishes. The continuation fires exactly once per round.
pub struct RuntimeRequest {
    pub send_buf: usize,
    pub recv_buf: usize,
    pub elem_cnt: usize,
    callback: Mutex<Option<CompletionCallback>>,
}

impl RuntimeRequest {
    pub fn new<F>(send_buf: usize, recv_buf: usize, elem_cnt: usize, callback: F) -> Arc<Self>
    where
        F: FnOnce(Result<(), ExecutionError>) + Send + 'static,
    {
        Arc::new(RuntimeRequest {
            send_buf,
            recv_buf,
            elem_cnt,
            callback: Mutex::new(Some(Box::new(callback))),
        })
    }

    /// Fires the completion continuation. Invoked by the executor after the
    /// backend signals the group, never by callers.
    pub fn complete(&self, result: Result<(), ExecutionError>) {
        let callback = self
            .callback
            .lock()
            .unwrap()
            .take()
            .expect("completion continuation already fired");
        callback(result);
    }
}

impl fmt::Debug for RuntimeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRequest")
            .field("send_buf", &self.send_buf)
            .field("recv_buf", &self.recv_buf)
            .field("elem_cnt", &self.elem_cnt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn complete_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let req = RuntimeRequest::new(0, 0, 16, move |res| {
            assert!(res.is_ok());
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        req.complete(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already fired")]
    fn double_complete_panics() {
        let req = RuntimeRequest::new(0, 0, 16, |_| {});
        req.complete(Ok(()));
        req.complete(Ok(()));
    }
}
