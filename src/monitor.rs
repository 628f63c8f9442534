//! Read-only HTTP monitor.
//!
//! `/dump` serves the table snapshot plus pipeline counters as JSON;
//! `/` serves a small HTML page that polls `/dump` every 2 seconds.

use crate::conn_table::{StateTable, TableSnapshot};
use crate::stats::{PipelineStats, StatsSnapshot};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything `/dump` renders, copied out of the live structures.
#[derive(Debug, Clone, Serialize)]
struct Dump {
    #[serde(flatten)]
    table: TableSnapshot,
    pipeline: StatsSnapshot,
}

/// Handle one monitor request.
pub async fn handle_request(
    req: Request<Body>,
    table: Arc<StateTable>,
    stats: Arc<PipelineStats>,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/dump") => handle_dump(&table, &stats),
        (&Method::GET, "/") => handle_index(),
        (method, path) => handle_not_found(method, path),
    }
}

fn handle_dump(
    table: &StateTable,
    stats: &PipelineStats,
) -> Result<Response<Body>, Infallible> {
    let dump = Dump {
        table: table.snapshot(),
        pipeline: stats.snapshot(),
    };
    let body = serde_json::to_string_pretty(&dump)
        .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

fn handle_index() -> Result<Response<Body>, Infallible> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Body::from(INDEX_HTML))
        .unwrap())
}

fn handle_not_found(method: &Method, path: &str) -> Result<Response<Body>, Infallible> {
    warn!("404 Not Found: {} {}", method, path);
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("404 Not Found"))
        .unwrap())
}

/// Serve the monitor until the task is cancelled or the server errors.
pub async fn serve(
    addr: SocketAddr,
    table: Arc<StateTable>,
    stats: Arc<PipelineStats>,
) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let table = table.clone();
        let stats = stats.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, table.clone(), stats.clone())
            }))
        }
    });

    info!("monitor: serving state table on http://{} (/, /dump)", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>TCP State Table</title>
  <style>
    body{font-family:sans-serif;margin:20px;}
    table{border-collapse:collapse;width:100%;}
    th,td{border:1px solid #ddd;padding:6px;font-size:14px;}
    th{background:#f3f3f3;position:sticky;top:0;}
    code{background:#f7f7f7;padding:1px 3px;border-radius:3px;}
  </style>
</head>
<body>
  <h1>TCP State Table</h1>
  <p>Auto-refreshes every 2s. JSON: <a href="/dump">/dump</a></p>
  <div id="stats"></div>
  <table id="tbl">
    <thead><tr><th>Src</th><th>Dst</th><th>State</th><th>Origin?</th><th>Idle (s)</th></tr></thead>
    <tbody></tbody>
  </table>
<script>
async function refresh(){
  const r = await fetch('/dump'); const s = await r.json();
  document.getElementById('stats').innerHTML =
    '<b>Total:</b> '+s.total+
    ' &nbsp; <b>Half-open:</b> '+s.half_open+
    ' &nbsp; <b>States:</b> <code>'+JSON.stringify(s.states)+'</code>'+
    '<br><b>Pipeline:</b> <code>'+JSON.stringify(s.pipeline)+'</code>'+
    '<br><b>SYN by src (window):</b> <code>'+JSON.stringify(s.syn_by_src)+'</code>'+
    '<br><b>RST by src (window):</b> <code>'+JSON.stringify(s.rst_by_src)+'</code>'+
    '<br><b>Banned (secs left):</b> <code>'+JSON.stringify(s.banned)+'</code>';
  const tb = document.querySelector('#tbl tbody'); tb.innerHTML = '';
  s.entries.sort((a,b)=> (a.state>b.state?1:-1));
  for(const e of s.entries){
    const tr = document.createElement('tr');
    tr.innerHTML =
      '<td>'+e.src+'</td>'+
      '<td>'+e.dst+'</td>'+
      '<td>'+e.state+'</td>'+
      '<td>'+(e.is_origin?'yes':'no')+'</td>'+
      '<td>'+e.idle_secs+'</td>';
    tb.appendChild(tr);
  }
}
setInterval(refresh, 2000); refresh();
</script>
</body></html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FloodConfig, TableConfig};

    fn fixtures() -> (Arc<StateTable>, Arc<PipelineStats>) {
        let table = Arc::new(StateTable::new(
            TableConfig::default(),
            FloodConfig::default(),
        ));
        (table, Arc::new(PipelineStats::new()))
    }

    fn create_request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_to_string(body: Body) -> String {
        let bytes = hyper::body::to_bytes(body).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_dump_returns_json_snapshot() {
        let (table, stats) = fixtures();
        table.decide([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, true, false, false, false);
        stats.record(true, "new->SYN_SENT");

        let req = create_request(Method::GET, "/dump");
        let response = handle_request(req, table, stats).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );

        let body = body_to_string(response.into_body()).await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["half_open"], 1);
        assert_eq!(json["pipeline"]["seen"], 1);
        assert_eq!(json["entries"][0]["src"], "10.0.0.1:40000");
        assert_eq!(json["limits"]["syn_per_ip_limit"], 50);
    }

    #[tokio::test]
    async fn test_index_returns_html() {
        let (table, stats) = fixtures();
        let req = create_request(Method::GET, "/");
        let response = handle_request(req, table, stats).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_to_string(response.into_body()).await;
        assert!(body.contains("TCP State Table"));
        assert!(body.contains("/dump"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (table, stats) = fixtures();
        let req = create_request(Method::GET, "/nonexistent");
        let response = handle_request(req, table, stats).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_is_404() {
        let (table, stats) = fixtures();
        let req = create_request(Method::POST, "/dump");
        let response = handle_request(req, table, stats).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
