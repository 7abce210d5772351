use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use futures::StreamExt;
use loomruntime::{FlowRequest, LoomRuntime, RuntimeConfig};
use serde::Serialize;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Application state shared across handlers
struct AppState {
    runtime: Arc<LoomRuntime>,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Cancels a streaming run when the client goes away.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "loomserver"
    }))
}

/// Synchronous invocation: run the submitted graph to completion and
/// return the redacted result.
#[post("/api/runs")]
async fn run_flow(
    data: web::Data<AppState>,
    request: web::Json<FlowRequest>,
) -> ActixResult<impl Responder> {
    let request = request.into_inner();
    info!("Executing workflow: {}", request.workflow_id);

    match data.runtime.run_flow(request).await {
        Ok(result) => Ok(HttpResponse::Ok().json(result)),
        Err(e) => {
            error!("Workflow execution rejected: {}", e);
            Ok(HttpResponse::BadRequest().json(ErrorResponse {
                error: e.to_string(),
            }))
        }
    }
}

/// Streaming invocation: newline-delimited progress events followed by one
/// terminal complete event. Disconnecting stops new node dispatch.
#[post("/api/runs/stream")]
async fn run_flow_stream(
    data: web::Data<AppState>,
    request: web::Json<FlowRequest>,
) -> ActixResult<impl Responder> {
    let request = request.into_inner();
    info!("Executing workflow (streaming): {}", request.workflow_id);

    let handle = data.runtime.run_flow_streaming(request);
    let guard = CancelOnDrop(handle.cancel.clone());

    let body = ReceiverStream::new(handle.events).map(move |event| {
        let _ = &guard;
        let mut line = serde_json::to_vec(&event).unwrap_or_default();
        line.push(b'\n');
        Ok::<_, actix_web::Error>(web::Bytes::from(line))
    });

    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(body))
}

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|spec_id| {
            let metadata = registry.get_metadata(spec_id);
            serde_json::json!({
                "specId": spec_id,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(nodes))
}

/// WebSocket endpoint for real-time execution events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting workflow engine server");

    let mut registry = loomruntime::NodeRegistry::new();
    loomnodes::register_all(&mut registry);

    let runtime = Arc::new(LoomRuntime::with_registry(
        Arc::new(registry),
        RuntimeConfig::default(),
    ));

    info!("Runtime initialized with standard nodes");

    let app_state = web::Data::new(AppState { runtime });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(run_flow)
            .service(run_flow_stream)
            .service(list_node_types)
            .service(websocket_events)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
