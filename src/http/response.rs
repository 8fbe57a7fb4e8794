//! Per-request response capture.
//!
//! Interceptors that read the final status or length share one
//! [`ResponseCapture`] per request. The capture middleware installs it and
//! counts the bytes the body actually yields, so compressed and streamed
//! bodies are measured as sent. Readers that need the byte count register a
//! completion hook; hooks run once the body ends or is dropped.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes, HttpBody},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use hyper::body::{Frame, SizeHint};

type Hook = Box<dyn FnOnce(&ResponseCapture) + Send>;

#[derive(Default)]
struct Captured {
    status: Option<StatusCode>,
    bytes_written: u64,
    installed: bool,
    finished: bool,
    hooks: Vec<Hook>,
}

/// Status and byte count of one response.
#[derive(Clone, Default)]
pub struct ResponseCapture {
    inner: Arc<Mutex<Captured>>,
}

impl std::fmt::Debug for ResponseCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let captured = self.lock();
        f.debug_struct("ResponseCapture")
            .field("status", &captured.status)
            .field("bytes_written", &captured.bytes_written)
            .field("finished", &captured.finished)
            .finish()
    }
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn installed() -> Self {
        let capture = Self::default();
        capture.lock().installed = true;
        capture
    }

    /// The capture installed on `request`, or a detached one.
    pub fn for_request<B>(request: &Request<B>) -> Self {
        request.extensions().get::<ResponseCapture>().cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Captured> {
        self.inner.lock().expect("response capture mutex poisoned")
    }

    pub fn set_status(&self, status: StatusCode) {
        self.lock().status = Some(status);
    }

    pub fn add_bytes(&self, n: u64) {
        self.lock().bytes_written += n;
    }

    /// Take the status from a response the handler returned.
    pub fn record<B>(&self, response: &Response<B>) {
        self.set_status(response.status());
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Explicit status if one was set, otherwise 200 once bytes were written.
    pub fn effective_status(&self) -> Option<StatusCode> {
        let captured = self.lock();
        match captured.status {
            Some(status) => Some(status),
            None if captured.bytes_written > 0 => Some(StatusCode::OK),
            None => None,
        }
    }

    /// Numeric form for logs and metric labels; 0 when nothing was sent.
    pub fn status_code(&self) -> u16 {
        self.effective_status().map_or(0, |s| s.as_u16())
    }

    /// Run `hook` once `response`'s body has been sent.
    ///
    /// With an installed capture the hook waits for the capture middleware's
    /// counting body. A detached capture counts `response` itself.
    pub fn on_complete<F>(&self, response: Response, hook: F) -> Response
    where
        F: FnOnce(&ResponseCapture) + Send + 'static,
    {
        self.record(&response);
        let installed = {
            let mut captured = self.lock();
            if captured.finished {
                drop(captured);
                hook(self);
                return response;
            }
            captured.hooks.push(Box::new(hook));
            captured.installed
        };
        if installed {
            response
        } else {
            self.count(response)
        }
    }

    fn count(&self, response: Response) -> Response {
        let capture = self.clone();
        response.map(|body| {
            Body::new(CountingBody {
                inner: body,
                capture,
                done: false,
            })
        })
    }

    fn complete(&self) {
        let hooks = {
            let mut captured = self.lock();
            if captured.finished {
                return;
            }
            captured.finished = true;
            std::mem::take(&mut captured.hooks)
        };
        for hook in hooks {
            hook(self);
        }
    }
}

/// Body wrapper counting the data bytes it yields. Completes the capture
/// at end of stream, on error or when dropped.
struct CountingBody {
    inner: Body,
    capture: ResponseCapture,
    done: bool,
}

impl CountingBody {
    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.capture.complete();
        }
    }
}

impl HttpBody for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let poll = Pin::new(&mut self.inner).poll_frame(cx);
        match &poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    self.capture.add_bytes(data.len() as u64);
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => self.finish(),
            Poll::Pending => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Install a fresh [`ResponseCapture`] and count the final response body.
pub async fn response_capture_middleware(mut request: Request<Body>, next: Next) -> Response {
    let capture = ResponseCapture::installed();
    request.extensions_mut().insert(capture.clone());
    let response = next.run(request).await;
    capture.record(&response);
    capture.count(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn effective_status_defaults_to_ok_after_write() {
        let capture = ResponseCapture::new();
        assert_eq!(capture.effective_status(), None);
        assert_eq!(capture.status_code(), 0);

        capture.add_bytes(12);
        assert_eq!(capture.effective_status(), Some(StatusCode::OK));

        capture.set_status(StatusCode::CREATED);
        assert_eq!(capture.effective_status(), Some(StatusCode::CREATED));
    }

    #[tokio::test]
    async fn hooks_see_the_bytes_actually_sent() {
        let capture = ResponseCapture::new();
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let hook_seen = Arc::clone(&seen);

        let stream = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let response = (StatusCode::NOT_FOUND, Body::from_stream(stream)).into_response();
        let response = capture.on_complete(response, move |capture| {
            hook_seen.store(capture.bytes_written(), Ordering::SeqCst);
        });
        assert_eq!(capture.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(seen.load(Ordering::SeqCst), u64::MAX);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 11);
        assert_eq!(seen.load(Ordering::SeqCst), 11);
        assert!(capture.is_finished());
    }

    #[test]
    fn dropped_body_still_completes() {
        let capture = ResponseCapture::new();
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let hook_seen = Arc::clone(&seen);
        let response = capture.on_complete("unsent".into_response(), move |capture| {
            hook_seen.store(capture.bytes_written(), Ordering::SeqCst);
        });
        drop(response);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_state() {
        let capture = ResponseCapture::new();
        let request = {
            let mut r = Request::new(());
            r.extensions_mut().insert(capture.clone());
            r
        };
        ResponseCapture::for_request(&request).set_status(StatusCode::BAD_GATEWAY);
        assert_eq!(capture.status_code(), 502);
    }
}
