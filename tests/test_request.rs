use streamgate::http::request::{Method, Request, RequestBuilder};

fn get(headers: &[(&str, &str)]) -> Request {
    headers
        .iter()
        .fold(RequestBuilder::new().method(Method::GET).path("/"), |b, (k, v)| {
            b.header(*k, *v)
        })
        .build()
        .unwrap()
}

#[test]
fn test_request_header_retrieval() {
    let req = get(&[("Host", "example.com"), ("Content-Type", "application/json")]);

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_keep_alive_http11_default() {
    // HTTP/1.1 defaults to keep-alive
    assert!(get(&[]).keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    assert!(!get(&[("Connection", "close")]).keep_alive());
    assert!(!get(&[("Connection", "Upgrade, Close")]).keep_alive());
}

#[test]
fn test_request_keep_alive_case_insensitive() {
    assert!(get(&[("Connection", "Keep-Alive")]).keep_alive());
}

#[test]
fn test_request_keep_alive_http10() {
    let plain = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .version("HTTP/1.0")
        .build()
        .unwrap();
    assert!(!plain.keep_alive());

    let explicit = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .version("HTTP/1.0")
        .header("Connection", "keep-alive")
        .build()
        .unwrap();
    assert!(explicit.keep_alive());
}

#[test]
fn test_request_path_and_query_split() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/api/apps?id=3&x=a%20b")
        .build()
        .unwrap();
    assert_eq!(req.path_only(), "/api/apps");
    assert_eq!(req.query(), Some("id=3&x=a%20b"));

    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/plain")
        .build()
        .unwrap();
    assert_eq!(req.path_only(), "/plain");
    assert_eq!(req.query(), None);
}

#[test]
fn test_request_websocket_upgrade_detection() {
    let upgrade = get(&[("Upgrade", "WebSocket"), ("Connection", "keep-alive, Upgrade")]);
    assert!(upgrade.is_websocket_upgrade());

    let missing_connection = get(&[("Upgrade", "websocket")]);
    assert!(!missing_connection.is_websocket_upgrade());

    let wrong_protocol = get(&[("Upgrade", "h2c"), ("Connection", "Upgrade")]);
    assert!(!wrong_protocol.is_websocket_upgrade());

    let post = RequestBuilder::new()
        .method(Method::POST)
        .path("/ws/signaling")
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .build()
        .unwrap();
    assert!(!post.is_websocket_upgrade());
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("POST"), Some(Method::POST));
    // Case-sensitive: lowercase is a distinct extension method
    assert_eq!(Method::from_str("get"), Some(Method::Extension("get".to_string())));
    assert_eq!(Method::from_str("MKCOL"), Some(Method::Extension("MKCOL".to_string())));
    assert_eq!(Method::from_str(""), None);
    assert_eq!(Method::from_str("GE T"), None);
}

#[test]
fn test_request_builder_requires_method_and_path() {
    assert!(RequestBuilder::new().path("/").build().is_err());
    assert!(RequestBuilder::new().method(Method::GET).build().is_err());
}

#[test]
fn test_request_with_body() {
    let body_content = b"test body content".to_vec();
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/api")
        .body(body_content.clone())
        .build()
        .unwrap();

    assert_eq!(req.body, body_content);
    assert_eq!(req.version, "HTTP/1.1");
}
