/**
 * MIT License
 *
 * Copyright (c) 2025 Takatoshi Kondo
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use clap::Parser;
use futures::future;
use mqtt_broker_lite::auth_impl::{AllowAll, Auth, Security};
use mqtt_broker_lite::broker::{Broker, BrokerConfig};
use mqtt_broker_lite::connection::handle_connection;
use mqtt_broker_lite::tracing_setup::{init_tracing, parse_level};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{error, info, trace};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "mqtt-broker")]
#[command(about = "MQTT v3.1.1 broker with configurable worker threads and logging")]
struct Args {
    /// Number of worker threads for async tasks
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Number of blocking threads for blocking operations
    #[arg(long)]
    max_blocking_threads: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    #[arg(value_parser = ["error", "warn", "info", "debug", "trace"])]
    log_level: String,

    #[arg(long)]
    tcp_port: Option<u16>,
    #[arg(long)]
    tls_port: Option<u16>,

    /// Path to server certificate file (required when tls_port is specified)
    #[arg(long)]
    server_crt: Option<String>,

    /// Path to server private key file (required when tls_port is specified)
    #[arg(long)]
    server_key: Option<String>,

    /// Enable TCP_NODELAY socket option
    #[arg(long)]
    socket_no_delay: Option<bool>,

    /// TCP socket send buffer size in bytes
    #[arg(long)]
    socket_send_buf_size: Option<usize>,

    /// TCP socket receive buffer size in bytes
    #[arg(long)]
    socket_recv_buf_size: Option<usize>,

    /// Enable SO_REUSEPORT for load balancing across threads (Linux only)
    #[arg(long)]
    socket_reuseport: Option<bool>,

    /// TCP keepalive time in seconds (0 to disable)
    #[arg(long)]
    socket_keepalive_time: Option<u32>,

    /// JSON users file; without it every client is allowed everything
    #[arg(long)]
    auth_file: Option<String>,

    /// Per-subscriber delivery queue size, overflow drops the newest message
    #[arg(long, default_value_t = 1000)]
    delivery_queue_size: usize,

    /// Queue size in front of the delivery sequencer
    #[arg(long, default_value_t = 1000)]
    sequencer_queue_size: usize,

    /// Packet handlers running concurrently per connection
    #[arg(long, default_value_t = 1)]
    handler_concurrency: usize,

    /// Time allowed between accept and CONNECT in milliseconds
    #[arg(long, default_value_t = 10000)]
    connect_timeout_ms: u64,

    /// Maximum inbound packet size in bytes (0 is unlimited)
    #[arg(long, default_value_t = 0)]
    max_packet_size: u32,
}

impl Args {
    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            delivery_queue_size: self.delivery_queue_size,
            sequencer_queue_size: self.sequencer_queue_size,
            handler_concurrency: self.handler_concurrency,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_packet_size: self.max_packet_size,
        }
    }
}

#[derive(Clone, Copy)]
struct SocketOptions {
    no_delay: Option<bool>,
    send_buf_size: Option<usize>,
    recv_buf_size: Option<usize>,
    keepalive_time: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = parse_level(&args.log_level)
        .ok_or_else(|| anyhow::anyhow!("Invalid log level: {}", args.log_level))?;

    let worker_threads = args.worker_threads.unwrap_or_else(num_cpus::get);

    // Build custom tokio runtime
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.worker_threads(worker_threads).enable_all();

    if let Some(max_blocking) = args.max_blocking_threads {
        runtime_builder.max_blocking_threads(max_blocking);
    }

    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(log_level, args))
}

/// Load TLS configuration for the broker
fn load_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{cert_path}': {e}"))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain = rustls_pemfile::certs(&mut cert_reader)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let key_file = File::open(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open private key file '{key_path}': {e}"))?;
    let mut key_reader = BufReader::new(key_file);

    // Try PKCS8 first, then PKCS1
    let mut private_keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?;
    if private_keys.is_empty() {
        key_reader = BufReader::new(File::open(key_path)?);
        private_keys = rustls_pemfile::rsa_private_keys(&mut key_reader)?;
    }
    let private_key = private_keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| anyhow::anyhow!("No private key found in '{key_path}'"))?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Configure individual socket options if specified
fn configure_individual_socket_options(
    stream: &tokio::net::TcpStream,
    addr: &SocketAddr,
    options: SocketOptions,
) {
    if let Some(no_delay) = options.no_delay {
        if let Err(e) = stream.set_nodelay(no_delay) {
            error!("Failed to set TCP_NODELAY for {addr}: {e}");
        }
    }

    let sock_ref = SockRef::from(stream);

    if let Some(send_buf_size) = options.send_buf_size.filter(|size| *size > 0) {
        if let Err(e) = sock_ref.set_send_buffer_size(send_buf_size) {
            error!("Failed to set send buffer size for {addr}: {e}");
        }
    }

    if let Some(recv_buf_size) = options.recv_buf_size.filter(|size| *size > 0) {
        if let Err(e) = sock_ref.set_recv_buffer_size(recv_buf_size) {
            error!("Failed to set recv buffer size for {addr}: {e}");
        }
    }

    if let Some(keepalive_time) = options.keepalive_time.filter(|time| *time > 0) {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(keepalive_time.into()));
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            error!("Failed to enable keepalive for {addr}: {e}");
        }
    }
}

/// Binds a listening socket. Socket options are applied before bind so
/// SO_REUSEPORT takes effect.
fn bind_listener(addr: SocketAddr, reuseport: Option<bool>) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| anyhow::anyhow!("Failed to set SO_REUSEADDR: {e}"))?;

    // SO_REUSEPORT (Linux only)
    #[cfg(target_os = "linux")]
    if reuseport == Some(true) {
        socket
            .set_reuse_port(true)
            .map_err(|e| anyhow::anyhow!("Failed to set SO_REUSEPORT: {e}"))?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = reuseport;

    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn load_auth(auth_file: Option<&str>) -> anyhow::Result<Arc<dyn Auth>> {
    match auth_file {
        Some(path) => {
            info!("Loading users from {path}");
            let security = Security::load_json(path)
                .map_err(|e| anyhow::anyhow!("Failed to load auth file '{path}': {e}"))?;
            Ok(Arc::new(security))
        }
        None => {
            info!("No auth file given, every client is allowed everything");
            Ok(Arc::new(AllowAll))
        }
    }
}

async fn async_main(log_level: tracing::Level, args: Args) -> anyhow::Result<()> {
    let _guard = init_tracing(log_level)?;

    info!("Starting MQTT Broker with log level: {log_level}");
    info!("Tokio runtime configuration:");
    info!(
        "  --worker-threads        {}",
        args.worker_threads.unwrap_or_else(num_cpus::get)
    );
    info!(
        "  --max-blocking-threads  {}",
        args.max_blocking_threads
            .map_or("None".to_string(), |v| v.to_string())
    );
    info!("Socket configuration:");
    info!(
        "  --socket-no-delay       {}",
        args.socket_no_delay
            .map_or("None".to_string(), |v| v.to_string())
    );
    info!(
        "  --socket-send-buf-size  {}",
        args.socket_send_buf_size
            .map_or("None".to_string(), |v| v.to_string())
    );
    info!(
        "  --socket-recv-buf-size  {}",
        args.socket_recv_buf_size
            .map_or("None".to_string(), |v| v.to_string())
    );
    info!(
        "  --socket-keepalive-time {}",
        args.socket_keepalive_time
            .map_or("None".to_string(), |v| v.to_string())
    );
    let broker_config = args.broker_config();
    info!("Broker configuration: {broker_config:?}");

    if args.tcp_port.is_none() && args.tls_port.is_none() {
        return Err(anyhow::anyhow!(
            "At least one of --tcp-port or --tls-port is required"
        ));
    }

    let tls_acceptor = match args.tls_port {
        Some(_) => match (&args.server_crt, &args.server_key) {
            (Some(cert_path), Some(key_path)) => Some(load_tls_acceptor(cert_path, key_path)?),
            _ => {
                return Err(anyhow::anyhow!(
                    "TLS certificate (--server-crt) and private key (--server-key) are required when --tls-port is specified"
                ))
            }
        },
        None => None,
    };

    let auth = load_auth(args.auth_file.as_deref())?;
    let broker = Broker::new(broker_config);
    let socket_options = SocketOptions {
        no_delay: args.socket_no_delay,
        send_buf_size: args.socket_send_buf_size,
        recv_buf_size: args.socket_recv_buf_size,
        keepalive_time: args.socket_keepalive_time,
    };
    let mut tasks = Vec::new();

    // TCP listener
    if let Some(port) = args.tcp_port {
        info!("Starting TCP listener on port {port}");
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let tcp_listener = bind_listener(bind_addr, args.socket_reuseport)?;
        info!("Listening on TCP port {port} for MQTT");

        let broker = broker.clone();
        let auth = auth.clone();
        let tcp_task = tokio::spawn(async move {
            loop {
                match tcp_listener.accept().await {
                    Ok((stream, addr)) => {
                        trace!("New TCP connection from: {addr}");
                        configure_individual_socket_options(&stream, &addr, socket_options);
                        tokio::spawn(handle_connection(broker.clone(), auth.clone(), stream, addr));
                    }
                    Err(e) => error!("Failed to accept TCP connection: {e}"),
                }
            }
        });
        tasks.push(tcp_task);
    }

    // TLS listener
    if let (Some(port), Some(acceptor)) = (args.tls_port, tls_acceptor) {
        info!("Starting TLS listener on port {port}");
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let tls_listener = bind_listener(bind_addr, args.socket_reuseport)?;
        info!("Listening on TLS port {port} for MQTT");

        let broker = broker.clone();
        let auth = auth.clone();
        let tls_task = tokio::spawn(async move {
            loop {
                match tls_listener.accept().await {
                    Ok((stream, addr)) => {
                        trace!("New TLS connection from: {addr}");

                        // Configure socket options before TLS handshake
                        configure_individual_socket_options(&stream, &addr, socket_options);

                        let broker = broker.clone();
                        let auth = auth.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    handle_connection(broker, auth, tls_stream, addr).await
                                }
                                Err(e) => error!("TLS handshake failed for {addr}: {e}"),
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept TLS connection: {e}"),
                }
            }
        });
        tasks.push(tls_task);
    }

    // Wait for any listener task to finish
    let (result, _index, _remaining) = future::select_all(tasks).await;
    if let Err(e) = result {
        error!("Listener task failed: {e}");
    }

    Ok(())
}
