use crate::config::{Config, Protocol};
use crate::net::listen_addr;
use crate::payload::Payload;
use crate::tcp::TcpServerSession;
use crate::udp::{UdpServerHandler, RECV_BUFFER_SIZE};
use crate::Result;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};

/// Speed test server.
///
/// TCP connections each get their own task; UDP datagrams are handled one
/// after another on a single task.
///
/// # Examples
///
/// ```no_run
/// use speedtest::{Config, Protocol, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new(Config::server(5201).with_protocol(Protocol::Udp));
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    payload: Payload,
}

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// A server whose socket is bound but not yet serving.
pub struct BoundServer {
    listener: Listener,
    config: Config,
    payload: Payload,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let payload = Payload::random(config.server_block_size);
        Self { config, payload }
    }

    /// Binds the configured address without serving yet.
    pub async fn bind(&self) -> Result<BoundServer> {
        let addr = listen_addr(self.config.bind_addr, self.config.port);

        let listener = match self.config.protocol {
            Protocol::Tcp => Listener::Tcp(TcpListener::bind(addr).await?),
            Protocol::Udp => Listener::Udp(Arc::new(UdpSocket::bind(addr).await?)),
        };

        Ok(BoundServer {
            listener,
            config: self.config.clone(),
            payload: self.payload.clone(),
        })
    }

    /// Binds and serves until the process is terminated.
    pub async fn run(&self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.listener {
            Listener::Tcp(listener) => listener.local_addr()?,
            Listener::Udp(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    pub async fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        match self.listener {
            Listener::Tcp(listener) => {
                info!("Begin TCP listen {}.", addr);
                serve_tcp(listener, self.config, self.payload).await
            }
            Listener::Udp(socket) => {
                info!("Begin UDP listen {}.", addr);
                serve_udp(socket, self.config, self.payload).await
            }
        }
    }
}

async fn serve_tcp(listener: TcpListener, config: Config, payload: Payload) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Cannot disable Nagle for {}: {}", addr, e);
                }
                let session = TcpServerSession::new(stream, addr.to_string(), payload.clone(), &config);

                tokio::spawn(async move {
                    if let Err(e) = session.run().await {
                        warn!("Error handling client {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

async fn serve_udp(socket: Arc<UdpSocket>, config: Config, payload: Payload) -> Result<()> {
    let mut handler = UdpServerHandler::new(socket.clone(), payload, &config);
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                if let Err(e) = handler.handle_datagram(&buf[..len], peer).await {
                    warn!("Error answering {}: {}", peer, e);
                }
            }
            Err(e) => {
                error!("Error receiving UDP datagram: {}", e);
            }
        }
    }
}
