//! X-Sendfile support.
//!
//! When enabled, requests advertise `X-Sendfile-Type: X-Sendfile`. A response
//! carrying `X-Sendfile: <path>` has its body replaced by that file, served
//! with the correct length, ranges and conditional handling.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::response::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response};
use futures_util::future::BoxFuture;
use tower::{Layer, Service, ServiceExt};
use tower_http::services::ServeFile;

pub const X_SENDFILE: HeaderName = HeaderName::from_static("x-sendfile");
pub const X_SENDFILE_TYPE: HeaderName = HeaderName::from_static("x-sendfile-type");

/// Layer that turns `X-Sendfile` responses into file responses.
#[derive(Debug, Clone, Copy)]
pub struct SendfileLayer {
    enabled: bool,
}

impl SendfileLayer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl<S> Layer<S> for SendfileLayer {
    type Service = SendfileService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SendfileService {
            inner,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendfileService<S> {
    inner: S,
    enabled: bool,
}

impl<S> Service<Request<Body>> for SendfileService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.enabled {
            request.headers_mut().remove(X_SENDFILE_TYPE);
            return Box::pin(inner.call(request));
        }

        request
            .headers_mut()
            .insert(X_SENDFILE_TYPE, HeaderValue::from_static("X-Sendfile"));
        let method = request.method().clone();
        let request_headers = request.headers().clone();

        Box::pin(async move {
            let response = inner.call(request).await?;
            let (mut parts, body) = response.into_parts();

            let Some(file) = parts.headers.remove(X_SENDFILE) else {
                return Ok(Response::from_parts(parts, body));
            };
            drop(body);

            let path = PathBuf::from(OsStr::from_bytes(file.as_bytes()));
            Ok(serve_file(path, &method, request_headers, parts).await)
        })
    }
}

/// Serve `path` in place of the application's body.
///
/// The application's headers are kept unless the file response sets them, and
/// an application `Content-Type` always wins.
async fn serve_file(
    path: PathBuf,
    method: &Method,
    request_headers: HeaderMap,
    mut app: Parts,
) -> Response<Body> {
    tracing::debug!(path = %path.display(), "X-Sendfile sending file");

    match tokio::fs::metadata(&path).await {
        Ok(metadata) => {
            app.headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
        }
        Err(_) => {
            app.headers.remove(header::CONTENT_LENGTH);
        }
    }

    let mut file_request = Request::new(Body::empty());
    *file_request.method_mut() = if method == Method::HEAD {
        Method::HEAD
    } else {
        Method::GET
    };
    *file_request.headers_mut() = request_headers;

    let file_response = match ServeFile::new(&path).oneshot(file_request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let (file_parts, file_body) = file_response.into_parts();

    let app_content_type = app.headers.get(header::CONTENT_TYPE).cloned();
    let mut headers = app.headers;
    for name in file_parts.headers.keys() {
        headers.remove(name);
    }
    let mut last_name: Option<HeaderName> = None;
    for (name, value) in file_parts.headers {
        let name = match name {
            Some(name) => name,
            None => match &last_name {
                Some(name) => name.clone(),
                None => continue,
            },
        };
        headers.append(name.clone(), value);
        last_name = Some(name);
    }
    if let Some(content_type) = app_content_type {
        headers.insert(header::CONTENT_TYPE, content_type);
    }

    let mut response = Response::new(Body::new(file_body));
    *response.status_mut() = file_parts.status;
    *response.headers_mut() = headers;
    response
}
