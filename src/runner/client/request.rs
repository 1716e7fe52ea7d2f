use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::namespace::Namespace;
use crate::resource::ObjectIdRef;
use crate::runner::client::Error;

use http::{header, Method, Request};
use hyper::Body;
use url::Url;

const APPLICATION_JSON: &str = "application/json";

pub fn get_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()), None)?;
    let req = make_req(url, Method::GET, client_config).body(Body::empty())?;
    Ok(req)
}

pub fn create_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    body: Vec<u8>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, namespace, None, None)?;
    let req = make_req(url, Method::POST, client_config)
        .header(header::CONTENT_TYPE, APPLICATION_JSON)
        .body(Body::from(body))?;
    Ok(req)
}

pub fn delete_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()), None)?;
    let req = make_req(url, Method::DELETE, client_config).body(Body::empty())?;
    Ok(req)
}

pub fn finalize_request(
    client_config: &ClientConfig,
    namespace: &Namespace,
) -> Result<Request<Body>, Error> {
    let url = make_url(
        client_config,
        crate::k8s_types::core::v1::Namespace,
        None,
        Some(namespace.name()),
        Some("finalize"),
    )?;
    let body = serde_json::to_vec(namespace)?;
    let req = make_req(url, Method::PUT, client_config)
        .header(header::CONTENT_TYPE, APPLICATION_JSON)
        .body(Body::from(body))?;
    Ok(req)
}

pub fn watch_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource_version: Option<&str>,
    label_selector: Option<&str>,
    timeout_seconds: Option<u32>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None, None)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        if let Some(vers) = resource_version {
            query.append_pair("resourceVersion", vers);
        }
        if let Some(selector) = label_selector {
            query.append_pair("labelSelector", selector);
        }
        if let Some(timeout) = timeout_seconds {
            query.append_pair("timeoutSeconds", &timeout.to_string());
        }
    }
    let req = make_req(url, Method::GET, client_config).body(Body::empty())?;
    Ok(req)
}

pub fn list_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    label_selector: Option<&str>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None, None)?;
    if let Some(selector) = label_selector {
        url.query_pairs_mut().append_pair("labelSelector", selector);
    }
    let req = make_req(url, Method::GET, client_config).body(Body::empty())?;
    Ok(req)
}

fn make_req(url: Url, method: Method, client_config: &ClientConfig) -> http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(header::ACCEPT, APPLICATION_JSON)
        .header(header::USER_AGENT, client_config.user_agent.as_str());
    if let Some(auth) = client_config.credentials.header_value() {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    if let Some(user) = client_config.impersonate.as_ref() {
        builder = builder.header("Impersonate-User", user.as_str());
    }
    for group in client_config.impersonate_groups.iter() {
        builder = builder.header("Impersonate-Group", group.as_str());
    }
    builder
}

fn make_url(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
    subresource: Option<&str>,
) -> Result<Url, Error> {
    let endpoint = client_config.api_server_endpoint.as_str();
    let mut url = Url::parse(endpoint).map_err(|err| {
        Error::InvalidRequest(format!("invalid api server endpoint '{}': {}", endpoint, err))
    })?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::InvalidRequest(format!("api server endpoint '{}' cannot be a base url", endpoint))
        })?;
        segments.pop_if_empty();

        let (group, version) = k8s_type.as_group_and_version();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(version);
        if let Some(ns) = namespace.filter(|_| k8s_type.namespaced) {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
        }
        if let Some(sub) = subresource {
            segments.push(sub);
        }
    }
    Ok(url)
}
