//! HTTP administration surface.
//!
//! Serves session and phone snapshots, runtime stats, the routing
//! table (with PATCH-to-reload) and the Prometheus metrics text.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::stack::SipStack;

type HttpResponse = Response<Full<Bytes>>;

/// Binds the admin listener and serves until the process exits.
pub async fn serve(stack: SipStack) -> Result<()> {
    let addr = (stack.config().server_ipv4, stack.config().http_port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "API webserver started");

    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let stack = stack.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let stack = stack.clone();
                async move { Ok::<_, std::convert::Infallible>(route(req, &stack).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(%err, "admin connection error");
            }
        });
    }
}

async fn route(req: Request<hyper::body::Incoming>, stack: &SipStack) -> HttpResponse {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => html(format!(
            "<h1>{} API Webserver</h1>\n",
            crate::message::headers::UA_NAME_VERSION
        )),
        (&Method::GET, "/api/v1/session") => json_of(&stack.session_summaries()),
        (&Method::GET, "/api/v1/phone") => {
            let phones: Vec<_> = stack.phones().all().iter().map(|p| p.view()).collect();
            json_of(&phones)
        }
        (&Method::GET, "/api/v1/stats") => json_of(&stats(stack)),
        (&Method::GET, "/api/v1/config") => match stack.routing_engine().to_json() {
            Ok(body) => json(body),
            Err(err) => {
                tracing::error!(%err, "failed to marshal routing data");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to marshal routing data")
            }
        },
        (&Method::PATCH, "/api/v1/config") => {
            stack.reload_routing().await;
            html(format!(
                "<h1>{} API Webserver - Config reloaded successfully</h1>\n",
                crate::message::headers::UA_NAME_VERSION
            ))
        }
        (&Method::GET, "/metrics") => {
            stack.metrics().set_caps(stack.limiter().current_caps());
            stack
                .metrics()
                .set_media_ports_in_use(stack.media().in_use() as i64);
            text(stack.metrics().render("sipbridge"))
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct Stats {
    cpu_count: usize,
    sessions_count: usize,
    media_ports_in_use: usize,
    media_ports_capacity: usize,
    rate_limit: i64,
}

fn stats(stack: &SipStack) -> Stats {
    Stats {
        cpu_count: num_cpus::get(),
        sessions_count: stack.session_count(),
        media_ports_in_use: stack.media().in_use(),
        media_ports_capacity: stack.media().capacity(),
        rate_limit: stack.limiter().limit(),
    }
}

fn json_of<T: serde::Serialize>(value: &T) -> HttpResponse {
    match serde_json::to_string(value) {
        Ok(body) => json(body),
        Err(err) => {
            tracing::error!(%err, "serialization failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failure")
        }
    }
}

fn json(body: String) -> HttpResponse {
    with_content_type("application/json", body)
}

fn text(body: String) -> HttpResponse {
    with_content_type("text/plain; charset=utf-8", body)
}

fn html(body: String) -> HttpResponse {
    with_content_type("text/html; charset=utf-8", body)
}

fn with_content_type(content_type: &str, body: String) -> HttpResponse {
    Response::builder()
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

fn error_response(code: StatusCode, message: &str) -> HttpResponse {
    Response::builder()
        .status(code)
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response")
}
