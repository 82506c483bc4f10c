//! Framed request/reply endpoint for the support surface

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{self, ProtocolError, SupportReply, SupportRequest};
use crate::support::registry::{HeartbeatAck, SupportRegistry};

/// Running support service endpoint
pub struct SupportService {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl SupportService {
    /// Binds the support endpoint and starts serving requests
    ///
    /// # Errors
    ///
    /// Returns the bind error; the orchestrator maps it to its exit code.
    pub async fn start(
        bind: &str,
        registry: SupportRegistry,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "support service listening");

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        debug!(peer = %peer, "support connection accepted");
                        let registry = registry.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, registry, cancel).await {
                                match e {
                                    ProtocolError::ConnectionClosed => {}
                                    other => warn!(peer = %peer, error = %other, "support connection dropped"),
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    /// Address the service actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting; established sessions drain on their own
    pub fn abort(&self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    registry: SupportRegistry,
    cancel: CancellationToken,
) -> Result<(), ProtocolError> {
    loop {
        let request: SupportRequest = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = protocol::read_frame(&mut stream) => frame?,
        };
        let reply = handle_request(&registry, request).await;
        protocol::write_frame(&mut stream, &reply).await?;
    }
}

async fn handle_request(registry: &SupportRegistry, request: SupportRequest) -> SupportReply {
    match request {
        SupportRequest::RegisterType { spec } => match registry.register_type(spec).await {
            Ok(()) => SupportReply::Ok,
            Err(e) => error_reply(e),
        },
        SupportRequest::RegisterInstance {
            instance_id,
            type_id,
            config,
        } => match registry.register_instance(instance_id, type_id, config).await {
            Ok(()) => SupportReply::Ok,
            Err(e) => error_reply(e),
        },
        SupportRequest::Heartbeat {
            instance_id,
            status,
        } => match registry.heartbeat(&instance_id, status).await {
            HeartbeatAck::Recorded => SupportReply::Ok,
            HeartbeatAck::ReregisterRequired => SupportReply::ReregisterRequired,
        },
        SupportRequest::ResolveConfig { instance_id } => {
            match registry.resolve_config(&instance_id).await {
                Ok(config) => SupportReply::Config { config },
                Err(e) => error_reply(e),
            }
        }
        SupportRequest::GetBrokerEndpoint => match registry.get_broker_endpoint().await {
            Ok(endpoint) => SupportReply::Endpoint { endpoint },
            Err(e) => error_reply(e),
        },
        SupportRequest::SetBrokerEndpoint { endpoint } => {
            registry.set_broker_endpoint(endpoint).await;
            SupportReply::Ok
        }
        SupportRequest::ListInstances { filter } => SupportReply::Instances {
            instances: registry.list_instances(&filter).await,
        },
    }
}

fn error_reply(error: crate::support::registry::RegistryError) -> SupportReply {
    SupportReply::Error {
        code: error.code().to_string(),
        message: error.to_string(),
    }
}
