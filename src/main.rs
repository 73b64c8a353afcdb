use actix_web::{App, HttpResponse, HttpServer, Responder, get, post, web};
use anyhow::Context;
use serde::Deserialize;
use serde_json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// for SSE streaming
use bytes::Bytes;
use tokio::sync::mpsc;

use outreach::config::Config;
use outreach::runner::RunEvent;
use outreach::service::{Outreach, TriggerRequest, TriggerResponse};

// -------------------------
// Request Types
// -------------------------

#[derive(Deserialize)]
struct ScrapeReq {
    /// Search results URL, with or without ?page=N. Paging starts from there.
    url: String,
    /// Location key the scraped listings are stored under.
    location: String,
    /// Optional page cap; never above the configured one.
    page_range: Option<usize>,
}

#[derive(Deserialize)]
struct LocationReq {
    location: String,
}

// -------------------------
// HTTP Handlers
// -------------------------

#[get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body(
        "Outreach online.\n\
         Leads:\n  POST /scrape {\"url\":\"https://maps.example.com/search?q=restaurants\",\"location\":\"lisbon\",\"page_range\":5}\n  POST /enrich {\"location\":\"lisbon\"}\n  GET  /leads?location=lisbon\n\
         Campaign:\n  POST /campaign {\"location\":\"lisbon\",\"max_recipients\":10}\n  GET  /campaign/stream?location=lisbon&max_recipients=10 (SSE)\n  GET  /quota",
    )
}

#[get("/healthz")]
async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[post("/scrape")]
async fn scrape_endpoint(app: web::Data<Outreach>, body: web::Json<ScrapeReq>) -> impl Responder {
    match app
        .scrape_location(&body.url, &body.location, body.page_range)
        .await
    {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => {
            let err = serde_json::json!({ "error": format!("{e:#}") });
            HttpResponse::BadRequest().json(err)
        }
    }
}

#[post("/enrich")]
async fn enrich_endpoint(app: web::Data<Outreach>, body: web::Json<LocationReq>) -> impl Responder {
    match app.enrich_location(&body.location).await {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => {
            let err = serde_json::json!({ "error": format!("{e:#}") });
            HttpResponse::BadRequest().json(err)
        }
    }
}

#[get("/leads")]
async fn leads_endpoint(app: web::Data<Outreach>, q: web::Query<LocationReq>) -> impl Responder {
    match app.leads(&q.location) {
        Ok(leads) => HttpResponse::Ok().json(leads),
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() })),
    }
}

#[get("/quota")]
async fn quota_endpoint(app: web::Data<Outreach>) -> impl Responder {
    match app.capacity() {
        Ok(cap) => HttpResponse::Ok().json(cap),
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() })),
    }
}

#[post("/campaign")]
async fn campaign_endpoint(
    app: web::Data<Outreach>,
    body: web::Json<TriggerRequest>,
) -> impl Responder {
    // Detached so a dropped client connection cannot cancel a run mid-send.
    let req = body.into_inner();
    let run = actix_web::rt::spawn(async move { app.run_campaign(req, None).await });
    let response = match run.await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "campaign task failed");
            let err = serde_json::json!({ "error": "campaign task failed", "count": 0 });
            return HttpResponse::InternalServerError().json(err);
        }
    };
    if matches!(response, TriggerResponse::Done { .. }) {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::BadRequest().json(response)
    }
}

// --------------
// SSE streaming
// --------------

fn sse_event(event: &str, data_json: &str) -> Bytes {
    let payload = format!("event: {}\ndata: {}\n\n", event, data_json);
    Bytes::from(payload)
}

fn event_name(ev: &RunEvent) -> &'static str {
    match ev {
        RunEvent::Started { .. } => "start",
        RunEvent::Sent { .. } => "sent",
        RunEvent::Failed { .. } => "failed",
        RunEvent::Skipped { .. } => "skipped",
        RunEvent::Finished { .. } => "finished",
    }
}

#[get("/campaign/stream")]
async fn campaign_stream(app: web::Data<Outreach>, q: web::Query<TriggerRequest>) -> impl Responder {
    let (tx, mut rx) = mpsc::channel::<Bytes>(32);
    let req = q.into_inner();

    actix_web::rt::spawn(async move {
        let (ev_tx, mut ev_rx) = mpsc::channel::<RunEvent>(32);
        let forward_tx = tx.clone();
        let forward = actix_web::rt::spawn(async move {
            while let Some(ev) = ev_rx.recv().await {
                let data = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
                let _ = forward_tx.send(sse_event(event_name(&ev), &data)).await;
            }
        });

        let response = app.run_campaign(req, Some(ev_tx)).await;
        // The runner's sender is dropped by now, so the forwarder drains and ends.
        let _ = forward.await;

        let data = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
        let name = match response {
            TriggerResponse::Done { .. } => "done",
            TriggerResponse::Error { .. } => "error",
        };
        let _ = tx.send(sse_event(name, &data)).await;
    });

    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, actix_web::Error>(chunk);
        }
    };

    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/event-stream"))
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("Connection", "keep-alive"))
        .streaming(stream)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("outreach=info".parse()?))
        .init();

    let config = Config::from_env().context("load configuration")?;
    config.log_redacted();

    let app = web::Data::new(Outreach::from_config(&config).context("wire services")?);
    let bind = (config.host.clone(), config.port);
    info!(host = %bind.0, port = bind.1, "starting outreach");

    HttpServer::new(move || {
        App::new()
            .app_data(app.clone())
            .service(index)
            .service(healthz)
            .service(scrape_endpoint)
            .service(enrich_endpoint)
            .service(leads_endpoint)
            .service(quota_endpoint)
            .service(campaign_endpoint)
            .service(campaign_stream) // SSE stream
    })
    .bind(bind)
    .inspect_err(|e| error!(error = %e, "bind failed"))?
    .run()
    .await?;
    Ok(())
}
