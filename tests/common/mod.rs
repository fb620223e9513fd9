use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP/1.1 server for tests. The handler gets the request target
/// (`/path?query`) and returns status and body; `None` never answers.
pub async fn spawn_server<F>(handler: F) -> String
where
    F: Fn(&str) -> Option<(u16, String)> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&request);
                let target = text.split_whitespace().nth(1).unwrap_or("/").to_string();

                match handler(&target) {
                    Some((status, body)) => {
                        let response = format!(
                            "HTTP/1.1 {} Test\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    }
                    None => tokio::time::sleep(Duration::from_secs(30)).await,
                }
            });
        }
    });

    format!("http://{}", addr)
}

/// Value of one query parameter of a request target.
pub fn query_param(target: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(&format!("http://localhost{}", target)).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Index response body: header row, then `rows`, then the resume-key separator.
pub fn index_body(rows: &[[&str; 4]]) -> String {
    let mut all: Vec<Vec<String>> = vec![vec![
        "urlkey".to_string(),
        "timestamp".to_string(),
        "digest".to_string(),
        "original".to_string(),
    ]];
    all.extend(rows.iter().map(|row| row.iter().map(|c| c.to_string()).collect()));
    all.push(vec![]);
    serde_json::to_string(&all).unwrap()
}
