//! Jenkins REST client against an in-process HTTP responder.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cifarm_core::jenkins::JenkinsRestAccessor;
use cifarm_core::FarmError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Request {
    request_line: String,
    head: String,
    body: String,
}

/// Serves a crumb and accepts scripts; records every request.
async fn spawn_jenkins(crumb_ready: bool) -> (String, Arc<Mutex<Vec<Request>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let request = read_request(&mut stream).await;
                let (status, body) = if request.request_line.contains("/crumbIssuer/") {
                    if crumb_ready {
                        ("200 OK", "Jenkins-Crumb:abc123".to_string())
                    } else {
                        ("503 Service Unavailable", "starting".to_string())
                    }
                } else if request.request_line.starts_with("POST /scriptText") {
                    ("200 OK", String::new())
                } else {
                    ("404 Not Found", String::new())
                };
                recorded.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (url, requests)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Request {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Request {
        request_line: head.lines().next().unwrap_or_default().to_string(),
        body: String::from_utf8_lossy(&data[header_end..]).to_string(),
        head,
    }
}

#[tokio::test]
async fn test_crumb_is_fetched_with_basic_auth() {
    let (url, requests) = spawn_jenkins(true).await;
    let jenkins = JenkinsRestAccessor::new(&url, "admin", "secret").unwrap();

    assert_eq!(jenkins.crumb().await.unwrap(), "Jenkins-Crumb:abc123");

    let requests = requests.lock().unwrap();
    assert!(requests[0].request_line.starts_with("GET /crumbIssuer/api/xml"));
    // base64("admin:secret")
    assert!(requests[0].head.to_lowercase().contains("authorization: basic ywrtaw46c2vjcmv0"));
}

#[tokio::test]
async fn test_online_server_is_detected() {
    let (url, _) = spawn_jenkins(true).await;
    let jenkins = JenkinsRestAccessor::new(&url, "admin", "secret").unwrap();
    jenkins
        .wait_until_online(Duration::ZERO, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_approvals_post_scripts_with_crumb() {
    let (url, requests) = spawn_jenkins(true).await;
    let jenkins = JenkinsRestAccessor::new(&url, "admin", "secret").unwrap();

    jenkins.approve_system_commands(&["ssh bla blub".to_string()]).await.unwrap();
    jenkins
        .approve_script_signatures(&["new java.lang.Exception java.lang.String".to_string()])
        .await
        .unwrap();

    let requests = requests.lock().unwrap();
    let posts: Vec<&Request> =
        requests.iter().filter(|r| r.request_line.starts_with("POST /scriptText")).collect();
    assert_eq!(posts.len(), 2);
    for post in &posts {
        assert!(post.head.to_lowercase().contains("jenkins-crumb: abc123"));
        assert!(post.body.starts_with("script="));
    }
    assert!(posts[0].body.contains("system-command"));
    assert!(posts[1].body.contains("approveSignature"));
}

#[tokio::test]
async fn test_server_that_never_issues_crumbs_times_out() {
    let (url, _) = spawn_jenkins(false).await;
    let jenkins = JenkinsRestAccessor::new(&url, "admin", "secret").unwrap();

    let start = Instant::now();
    let err = jenkins
        .wait_until_online(Duration::ZERO, Duration::from_millis(20), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, FarmError::ServerNotOnline { .. }), "{}", err);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_unreachable_server_times_out() {
    // Bind and drop to get a port nobody listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let jenkins = JenkinsRestAccessor::new(&format!("http://127.0.0.1:{}", port), "a", "b").unwrap();
    let err = jenkins
        .wait_until_online(Duration::ZERO, Duration::from_millis(20), Duration::from_millis(100))
        .await
        .unwrap_err();
    match err {
        FarmError::ServerNotOnline { url, .. } => assert!(url.ends_with(&port.to_string())),
        other => panic!("unexpected error: {}", other),
    }
}
