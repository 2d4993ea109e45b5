use axum::{extract::DefaultBodyLimit, http::Method};
use clap::Parser;
use didcomm_sdk::{
    Agent, AgentConfig, AgentEvent, Error,
    protocols::{connection::DidExchangeState, pickup},
    transport::inbound,
};
use std::{net::SocketAddrV4, path::PathBuf, time::Duration};
use tokio::{signal, sync::broadcast::error::RecvError};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PICKUP_INTERVAL: Duration = Duration::from_secs(5);
const CONNECT_POLLS: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "didcomm-agent")]
#[command(about = "Run a DIDComm agent with HTTP and WebSocket inbound endpoints")]
struct Cli {
    #[arg(short, long, default_value_t = 3000, help = "The port on which the agent will listen")]
    port: u16,
    #[arg(short, long, help = "JSON agent configuration; flags override its values")]
    config: Option<PathBuf>,
    #[arg(short, long, help = "Label presented to other agents")]
    label: Option<String>,
    #[arg(
        short,
        long,
        help = "Public endpoint of this agent (default: http://localhost:<port>)"
    )]
    endpoint: Option<String>,
    #[arg(short, long, help = "Invitation URL to accept instead of creating one")]
    invitation: Option<String>,
    #[arg(long, help = "Accept connections, credentials and proofs automatically")]
    auto_accept: bool,
    #[arg(
        long,
        help = "Request mediation over the connection the invitation opens; its messages are then picked up"
    )]
    mediated: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().without_time().with_ansi(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "didcomm_sdk=debug,didcomm_agent=trace".into()),
        )
        .init();

    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .await
            .expect("could not read agent configuration"),
        None => AgentConfig::new("didcomm agent"),
    };

    if let Some(label) = args.label {
        config.label = label;
    }

    let endpoint = args
        .endpoint
        .or_else(|| config.endpoints.first().cloned())
        .unwrap_or_else(|| format!("http://localhost:{}", args.port));
    if !config.endpoints.contains(&endpoint) {
        config.endpoints.insert(0, endpoint.clone());
    }

    if args.auto_accept {
        config.auto_accept_connections = true;
        config.auto_accept_credentials = true;
        config.auto_accept_proofs = true;
    }

    let agent = Agent::builder(config)
        .build()
        .expect("could not build agent");

    tokio::spawn(log_events(agent.clone()));

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = inbound::router(agent.clone())
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(cors);

    let addr = SocketAddrV4::new("0.0.0.0".parse().unwrap(), args.port);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    tracing::debug!("listening on {}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .unwrap();
    });

    match args.invitation {
        Some(invitation_url) => match accept_invitation(&agent, &invitation_url).await {
            Ok(connection_id) if args.mediated => {
                tracing::info!("accepted invitation, connection {connection_id}");
                if let Err(e) = use_mediator(&agent, &connection_id).await {
                    tracing::error!("mediation over {connection_id} failed: {e}");
                }
            }
            Ok(connection_id) => tracing::info!("accepted invitation, connection {connection_id}"),
            Err(e) => tracing::error!("could not accept invitation: {e}"),
        },
        None => {
            let (record, invitation) = agent
                .connections()
                .create_invitation(None)
                .await
                .expect("could not create invitation");

            tracing::info!("created invitation, connection {}", record.id);
            println!("{}", invitation.to_url(&endpoint).expect("invalid endpoint"));
        }
    }

    server.await.unwrap();
    agent.shutdown().await;
}

/// The invitation was asked for on the command line, so it is accepted even
/// without `--auto-accept`
async fn accept_invitation(agent: &Agent, invitation_url: &str) -> Result<String, Error> {
    let connections = agent.connections();
    let mut record = connections.receive_invitation_url(invitation_url).await?;

    if record.state == DidExchangeState::InvitationReceived {
        record = connections.accept_invitation(&record.id).await?;
    }

    Ok(record.id)
}

/// Ask the peer of `connection_id` to mediate and keep fetching what it
/// holds for us
async fn use_mediator(agent: &Agent, connection_id: &str) -> Result<(), Error> {
    for _ in 0..CONNECT_POLLS {
        if agent.connections().get(connection_id).await?.state == DidExchangeState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let mediation = agent.mediation().request(connection_id).await?;
    if !mediation.is_granted() {
        tracing::warn!("mediation {} is {}; not picking up", mediation.id, mediation.state);
        return Ok(());
    }

    let agent = agent.clone();
    let connection_id = connection_id.to_string();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PICKUP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = agent.mediation().pickup(&connection_id, pickup::DEFAULT_BATCH_SIZE).await {
                tracing::warn!("pickup from {connection_id} failed: {e}");
            }
        }
    });

    Ok(())
}

async fn log_events(agent: Agent) {
    let mut events = agent.subscribe();

    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(missed)) => tracing::warn!("missed {missed} events"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &AgentEvent) {
    match event {
        AgentEvent::ConnectionStateChanged {
            connection_id,
            state,
            ..
        } => tracing::info!("connection {connection_id}: {state}"),
        AgentEvent::CredentialStateChanged {
            credential_exchange_id,
            state,
            ..
        } => tracing::info!("credential exchange {credential_exchange_id}: {state}"),
        AgentEvent::ProofStateChanged {
            proof_exchange_id,
            state,
            ..
        } => tracing::info!("proof exchange {proof_exchange_id}: {state}"),
        AgentEvent::MediationStateChanged {
            mediation_id,
            state,
            ..
        } => tracing::info!("mediation {mediation_id}: {state}"),
        AgentEvent::FeaturesDisclosed {
            connection_id,
            protocols,
            ..
        } => tracing::info!(
            "{} speaks {} protocols",
            connection_id.as_deref().unwrap_or("peer"),
            protocols.len()
        ),
        AgentEvent::MessageReceived {
            message,
            connection_id,
        } => tracing::info!(
            "received {} ({}) on {}",
            message.message_type,
            message.id,
            connection_id.as_deref().unwrap_or("no connection")
        ),
        AgentEvent::MessageSent {
            message_id, status, ..
        } => tracing::info!("sent {message_id}: {status:?}"),
        AgentEvent::ProblemReportReceived {
            thread_id,
            code,
            description,
            ..
        } => tracing::warn!("problem report on thread {thread_id}: {code} {description}"),
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
