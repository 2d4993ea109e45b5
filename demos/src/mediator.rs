use axum::{extract::DefaultBodyLimit, http::Method};
use clap::Parser;
use didcomm_sdk::{Agent, AgentConfig, AgentEvent, transport::inbound};
use std::{net::SocketAddrV4, path::PathBuf};
use tokio::{signal, sync::broadcast::error::RecvError};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "didcomm-mediator")]
#[command(about = "Relay forwarded DIDComm messages and hold them for offline recipients")]
struct Cli {
    #[arg(short, long, default_value_t = 3001, help = "The port on which the mediator will listen")]
    port: u16,
    #[arg(short, long, help = "JSON agent configuration; flags override its values")]
    config: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Public endpoint of the mediator (default: http://localhost:<port>)"
    )]
    endpoint: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().without_time().with_ansi(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "didcomm_sdk=debug,didcomm_mediator=trace".into()),
        )
        .init();

    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .await
            .expect("could not read mediator configuration"),
        None => AgentConfig::new("didcomm mediator"),
    };

    let endpoint = args
        .endpoint
        .or_else(|| config.endpoints.first().cloned())
        .unwrap_or_else(|| format!("http://localhost:{}", args.port));
    if !config.endpoints.contains(&endpoint) {
        config.endpoints.insert(0, endpoint.clone());
    }

    // recipients connect and ask for mediation without a human on this side
    config.auto_accept_connections = true;
    config.auto_accept_mediation = true;

    let mediator = Agent::builder(config)
        .build()
        .expect("could not build mediator");

    tokio::spawn(log_events(mediator.clone()));

    let (record, invitation) = mediator
        .connections()
        .create_invitation(None)
        .await
        .expect("could not create invitation");
    tracing::info!("created invitation, connection {}", record.id);
    println!("{}", invitation.to_url(&endpoint).expect("invalid endpoint"));

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = inbound::router(mediator.clone())
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(cors);

    let addr = SocketAddrV4::new("0.0.0.0".parse().unwrap(), args.port);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    tracing::debug!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    mediator.shutdown().await;
}

async fn log_events(mediator: Agent) {
    let mut events = mediator.subscribe();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("missed {missed} events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            AgentEvent::ConnectionStateChanged {
                connection_id,
                state,
                ..
            } => tracing::info!("connection {connection_id}: {state}"),
            AgentEvent::MessageReceived {
                message,
                connection_id,
            } => tracing::debug!(
                "received {} from {}",
                message.message_type,
                connection_id.as_deref().unwrap_or("unknown sender")
            ),
            AgentEvent::MessageSent {
                message_id,
                connection_id,
                status,
            } => tracing::info!(
                "relayed {message_id} to {}: {status:?}",
                connection_id.as_deref().unwrap_or("unknown recipient")
            ),
            AgentEvent::MediationStateChanged {
                connection_id,
                state,
                ..
            } => tracing::info!("mediation for {connection_id}: {state}"),
            AgentEvent::ProblemReportReceived {
                code, description, ..
            } => tracing::warn!("problem report: {code} {description}"),
            _ => {}
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
