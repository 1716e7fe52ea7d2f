mod request;

use crate::config::{CAData, ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::namespace::Namespace;
use crate::resource::ObjectIdRef;
use crate::runner::metrics::ClientMetrics;

use bytes::Buf;
use http::{Request, Response};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use lazy_static::lazy_static;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslMethod};
use openssl::x509::X509;
use regex::bytes::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_stream::StreamExt;

use std::fs::File;
use std::io;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

lazy_static! {
    static ref NEWLINE_REGEX: Regex = Regex::new("([\\r\\n]+)").expect("newline regex is valid");
}

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Http(http::StatusCode),
    /// A non-success response that included a `Status` body
    Api(ApiError),
    InvalidRequest(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Serde(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Api(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Http(_) | Error::InvalidRequest(_) => None,
        }
    }
}

impl Error {
    pub fn http(status: http::StatusCode) -> Error {
        Error::Http(status)
    }

    pub fn not_found() -> Error {
        Error::Http(http::StatusCode::NOT_FOUND)
    }

    pub fn is_http_410(&self) -> bool {
        self.is_http_status(410)
    }

    pub fn is_not_found(&self) -> bool {
        self.is_http_status(404)
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        match self {
            Error::Http(ref status) => status.as_u16() == code,
            Error::Api(ref api_err) => api_err.code == code,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "Io Error: {}", e),
            Error::Serde(ref e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http(ref e) => write!(f, "Http Error: {}", e),
            Error::Api(ref e) => e.fmt(f),
            Error::InvalidRequest(ref msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}
impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::InvalidRequest(e.to_string())
    }
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// Http client for the Kubernetes api server. Cloning is cheap, and all clones share the same
/// connection pool.
#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(mut config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // enable http2 using alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;
        match config.ca_data.take() {
            Some(CAData::Contents(certs)) => {
                // inline CA data from a kubeconfig has to be parsed and added to the cert store manually
                let decoded = decode_base64(&certs, "certificate-authority-data")?;
                let certs = X509::stack_from_pem(decoded.as_slice())?;
                let cert_store = ssl.cert_store_mut();
                for cert in certs {
                    cert_store.add_cert(cert)?;
                }
            }
            Some(CAData::File(path)) => {
                ssl.set_ca_file(path.as_str())?;
            }
            None => {}
        }

        let client_cert = match config.credentials {
            Credentials::PemPath {
                ref certificate_path,
                ref private_key_path,
            } => Some((read_file(certificate_path)?, read_file(private_key_path)?)),
            Credentials::Pem {
                ref certificate_base64,
                ref private_key_base64,
            } => Some((
                decode_base64(certificate_base64, "client-certificate-data")?,
                decode_base64(private_key_base64, "client-key-data")?,
            )),
            Credentials::Header(_) => None,
        };
        if let Some((cert, key)) = client_cert {
            let cert = X509::from_pem(cert.as_slice())?;
            let pkey = PKey::private_key_from_pem(key.as_slice())?;
            ssl.set_certificate(&*cert)?;
            ssl.set_private_key(&*pkey)?;
            // ensures that the provided private key and certificate actually go together
            ssl.check_private_key()?;
        }

        if config.verify_ssl_certs {
            ssl.set_verify(openssl::ssl::SslVerifyMode::PEER);
        } else {
            log::warn!("TLS Certificate verification has been disabled! All connections to the Kubernetes api server will be insecure!");
            ssl.set_verify(openssl::ssl::SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let client = HyperClient::builder().build(https);

        let inner = ClientInner {
            http_client: client,
            config,
            metrics,
        };
        Ok(Client(Arc::new(inner)))
    }

    pub async fn list_all<T: DeserializeOwned>(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<T>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, label_selector, namespace)?;
        self.get_response_body(req).await
    }

    pub async fn watch<T: DeserializeOwned>(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<LineDeserializer<WatchEvent<T>>, Error> {
        let req = request::watch_request(
            &self.0.config,
            k8s_type,
            resource_version,
            label_selector,
            None,
            namespace,
        )?;
        self.get_response_lines_deserialized(req).await
    }

    /// gets the requested resource by name and converts a 404 response into a None value
    pub async fn get_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<Option<Value>, Error> {
        let req = request::get_request(&self.0.config, k8s_type, id)?;
        match self.get_response_body::<Value>(req).await {
            Ok(body) => Ok(Some(body)),
            Err(ref e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates the resource from an already encoded body, returning the object as it was
    /// persisted by the api server
    pub async fn create_resource(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Value, Error> {
        let req = request::create_request(&self.0.config, k8s_type, namespace, body)?;
        self.get_response_body(req).await
    }

    /// Deletes the resource. A 404 response is returned as an error so that callers can decide
    /// whether it matters to them. A 409 means the object is already being deleted, which is
    /// treated as success.
    pub async fn delete_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<(), Error> {
        log::info!("Deleting resource '{}' with type: {}", id, k8s_type);
        let req = request::delete_request(&self.0.config, k8s_type, id)?;
        let response = self.get_response(req).await?;

        match response.status().as_u16() {
            200..=299 | 409 => Ok(()),
            other => {
                if other != 404 {
                    log::error!(
                        "Delete request for {} : {} failed with status: {}",
                        k8s_type,
                        id,
                        other
                    );
                }
                Err(Client::error_from_response(response).await)
            }
        }
    }

    /// Replaces the namespace using its `finalize` subresource, which is the only way to modify
    /// `spec.finalizers` of a namespace.
    pub async fn finalize_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error> {
        let req = request::finalize_request(&self.0.config, namespace)?;
        self.get_response_body(req).await
    }

    async fn get_response_lines_deserialized<T: DeserializeOwned>(
        &self,
        req: Request<Body>,
    ) -> Result<LineDeserializer<T>, Error> {
        let lines = self.get_response_lines(req).await?;
        Ok(LineDeserializer::<T>::new(lines))
    }

    async fn get_response_lines(&self, req: Request<Body>) -> Result<Lines, Error> {
        let resp = self.get_response(req).await?;
        if !resp.status().is_success() {
            Err(Client::error_from_response(resp).await)
        } else {
            Ok(Lines::from_body(resp.into_body()))
        }
    }

    async fn get_response(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        self.private_execute_request(start_time, method.as_str(), uri.as_str(), req)
            .await
    }

    async fn get_response_body<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        let response = self
            .private_execute_request(start_time, method.as_str(), uri.as_str(), req)
            .await?;

        let status_code = response.status().as_u16();
        let result = Client::read_body(response).await;
        let duration = start_time.elapsed().as_millis();
        log::debug!(
            "Finished {} request to: {}, status: {}, total_duration: {}ms, success: {}",
            method,
            uri,
            status_code,
            duration,
            result.is_ok()
        );
        result
    }

    async fn private_execute_request(
        &self,
        start_time: Instant,
        method: &str,
        uri: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        log::debug!("Starting {} request to: {}", method, uri);
        let timer = self.0.metrics.request_started(method);
        let result = self.0.http_client.request(req).await;
        let duration = start_time.elapsed().as_millis();
        timer.observe_duration();
        match result {
            Ok(resp) => {
                log::debug!(
                    "Response status received for {} to: {}, status: {}, duration: {}ms",
                    method,
                    uri,
                    resp.status().as_u16(),
                    duration
                );
                Ok(resp)
            }
            Err(err) => {
                self.0.metrics.request_failed(method);
                log::error!(
                    "Failed to execute {} request to: {}, err: {}",
                    method,
                    uri,
                    err
                );
                Err(err.into())
            }
        }
    }

    /// Turns an unsuccessful response into an error, using the `Status` from the body if
    /// the api server sent one
    async fn error_from_response(response: Response<Body>) -> Error {
        let status = response.status();
        let body = match hyper::body::to_bytes(response.into_body()).await {
            Ok(b) => b,
            Err(err) => return err.into(),
        };
        match serde_json::from_slice::<ApiError>(body.as_ref()) {
            Ok(api_error) => {
                log::debug!("Response status: {}, api error: {}", status, api_error);
                Error::Api(api_error)
            }
            Err(_) => {
                log::debug!(
                    "Response status: {}, body: {}",
                    status,
                    String::from_utf8_lossy(body.as_ref())
                );
                Error::http(status)
            }
        }
    }

    async fn read_body<T: DeserializeOwned>(response: Response<Body>) -> Result<T, Error> {
        if !response.status().is_success() {
            return Err(Client::error_from_response(response).await);
        }

        let deserialized = if log::log_enabled!(log::Level::Trace) {
            // logging the body means reading it all into a single buffer first
            let body = hyper::body::to_bytes(response.into_body()).await?;
            let as_str = String::from_utf8_lossy(body.as_ref());
            log::trace!("Got response body: {}", as_str);
            serde_json::from_slice(body.as_ref())?
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            serde_json::from_reader(body.reader())?
        };
        Ok(deserialized)
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, io::Error> {
    let mut file = File::open(path)?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    Ok(content)
}

fn decode_base64(data: &str, field: &str) -> Result<Vec<u8>, io::Error> {
    base64::decode(data).map_err(|err| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Invalid base64 content of {}: {}", field, err),
        )
    })
}

/// Splits a streaming response body into lines, as they're sent by the api server for watches
pub struct Lines {
    body: Body,
    remaining: Option<bytes::Bytes>,
    current_line: Vec<bytes::Bytes>,
}

impl Lines {
    pub fn from_body(body: Body) -> Lines {
        Lines {
            body,
            remaining: None,
            current_line: Vec::with_capacity(2),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Line<'_>, Error>> {
        self.current_line.clear();

        loop {
            if let Some(mut remaining) = self.remaining.take() {
                let res = Lines::index_of_newline(&remaining[..]);
                if let Some((start, end)) = res {
                    let mut line = remaining.split_to(end);
                    if !remaining.is_empty() {
                        self.remaining = Some(remaining);
                    }
                    if start > 0 || !self.current_line.is_empty() {
                        line.truncate(start);
                        self.current_line.push(line);
                        return Some(Ok(self.make_line()));
                    }
                } else {
                    // no newline yet, so this chunk is the start of a line that continues in the next one
                    self.current_line.push(remaining);
                }
            } else {
                match self.body.next().await {
                    Some(Ok(bytes)) => self.remaining = Some(bytes),
                    Some(Err(e)) => {
                        log::error!("Error reading response lines: {}", e);
                        return Some(Err(e.into()));
                    }
                    None => {
                        if !self.current_line.is_empty() {
                            return Some(Ok(self.make_line()));
                        } else {
                            return None;
                        }
                    }
                }
            }
        }
    }

    fn make_line(&mut self) -> Line {
        Line {
            buffer: self.current_line.as_mut_slice(),
        }
    }

    fn index_of_newline(bytes: &[u8]) -> Option<(usize, usize)> {
        NEWLINE_REGEX.find(bytes).map(|m| (m.start(), m.end()))
    }
}

pub struct Line<'a> {
    buffer: &'a mut [bytes::Bytes],
}

impl<'a> Line<'a> {
    fn is_empty(&self) -> bool {
        self.buffer.iter().map(bytes::Bytes::len).sum::<usize>() == 0usize
    }
}

impl<'a> std::io::Read for Line<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut bytes_written = 0;
        let mut dest = buf;

        while !self.buffer.is_empty() && !dest.is_empty() {
            let byte_count = dest.len().min(self.buffer[0].len());
            dest[..byte_count].copy_from_slice(&self.buffer[0][..byte_count]);
            bytes_written += byte_count;
            dest = &mut dest[byte_count..];
            let _ = self.buffer[0].split_to(byte_count);
            if self.buffer[0].is_empty() {
                let tmp: &mut [bytes::Bytes] = std::mem::take(&mut self.buffer);
                self.buffer = &mut tmp[1..];
            }
        }
        Ok(bytes_written)
    }
}

/// Deserializes each non-empty line of a response as a json value of type `T`
pub struct LineDeserializer<T: DeserializeOwned> {
    lines: Lines,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> LineDeserializer<T> {
    pub fn new(lines: Lines) -> Self {
        Self {
            lines,
            _phantom: std::marker::PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        loop {
            let line = self.lines.next().await?;
            match line {
                Ok(reader) if !reader.is_empty() => {
                    return Some(serde_json::from_reader(reader).map_err(Into::into))
                }
                Err(err) => return Some(Err(err)),
                _ => { /* empty line, so we'll loop again */ }
            }
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    Error(ApiError),
}

/// The `Status` object that the api server returns for failed requests
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl ApiError {
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> ApiError {
        ApiError {
            status: "Failure".to_owned(),
            message: message.into(),
            reason: reason.into(),
            code,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Api Error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}
impl std::error::Error for ApiError {}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use hyper::Body;
    use std::io::Read;
    use tokio::runtime;

    fn body_from_chunks(chunks: Vec<&'static [u8]>) -> Body {
        let stream = tokio_stream::iter(chunks).map(|b| {
            let res: Result<Bytes, std::io::Error> = Ok(Bytes::from_static(b));
            res
        });
        Body::wrap_stream(stream)
    }

    #[test]
    fn lines_iterates_lines() {
        let input1 = &b"line1\nline2\r\nline3\r\n\r\n\r\n\rlong"[..];
        let input2 = &b"line4\r\r"[..];
        let input3 = &b"\r\nline5"[..];
        let mut lines = Lines::from_body(body_from_chunks(vec![input1, input2, input3]));

        let runtime = runtime::Builder::new_current_thread().build().unwrap();

        let expected = ["line1", "line2", "line3", "longline4", "line5"];

        runtime.block_on(async move {
            for expected_line in expected.iter() {
                let mut line = lines
                    .next()
                    .await
                    .expect("line returned none")
                    .expect("line returned error");
                let mut string = String::new();
                line.read_to_string(&mut string)
                    .expect("failed to read to string");
                assert_eq!(*expected_line, string.as_str());
                assert!(line.is_empty());
            }
            assert!(lines.next().await.is_none());
        });
    }

    #[test]
    fn watch_events_are_deserialized_from_lines() {
        let input1 = &b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"name\":\"ns1\"}}}\n{\"type\":\"MODI"[..];
        let input2 = &b"FIED\",\"object\":{\"metadata\":{\"name\":\"ns1\"},\"status\":{\"phase\":\"Terminating\"}}}\n"[..];
        let input3 = &b"{\"type\":\"ERROR\",\"object\":{\"status\":\"Failure\",\"code\":410,\"reason\":\"Expired\"}}\n"[..];
        let lines = Lines::from_body(body_from_chunks(vec![input1, input2, input3]));
        let mut events = LineDeserializer::<WatchEvent<Namespace>>::new(lines);

        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async move {
            match events.next().await {
                Some(Ok(WatchEvent::Added(ns))) => assert_eq!("ns1", ns.name()),
                other => panic!("expected added event, got: {:?}", other.map(|r| r.is_ok())),
            }
            match events.next().await {
                Some(Ok(WatchEvent::Modified(ns))) => assert!(ns.is_terminating()),
                other => panic!("expected modified event, got: {:?}", other.map(|r| r.is_ok())),
            }
            match events.next().await {
                Some(Ok(WatchEvent::Error(err))) => assert_eq!(410, err.code),
                other => panic!("expected error event, got: {:?}", other.map(|r| r.is_ok())),
            }
            assert!(events.next().await.is_none());
        });
    }

    #[test]
    fn not_found_is_detected_from_status_and_api_errors() {
        assert!(Error::not_found().is_not_found());
        assert!(Error::Api(ApiError::new(404, "NotFound", "builds \"foo\" not found")).is_not_found());
        assert!(!Error::Api(ApiError::new(403, "Forbidden", "nope")).is_not_found());
        assert!(Error::Api(ApiError::new(410, "Expired", "too old")).is_http_410());
    }
}
