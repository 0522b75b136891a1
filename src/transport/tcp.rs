use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::Handshake;
use crate::service::connection::{Connection, PendingConnection, ProtocolContext};
use crate::utils::timeout::with_timeout_error;

/// Bind `server.address` and serve until CTRL+C.
#[instrument(skip_all, fields(address = %ctx.config.server.address))]
pub async fn start_server(ctx: ProtocolContext, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let listener = TcpListener::bind(&ctx.config.server.address).await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    start_server_with_shutdown(listener, ctx, dispatcher, shutdown_rx).await
}

/// Serve connections from `listener` until `shutdown_rx` fires.
///
/// Each accepted socket gets its own task, which runs the handshake and then
/// serves packets through `dispatcher`. Sockets beyond
/// `server.max_connections` are dropped on accept. On shutdown, live
/// connections are told to close and given `server.shutdown_timeout` to
/// drain.
#[instrument(skip_all)]
pub async fn start_server_with_shutdown(
    listener: TcpListener,
    ctx: ProtocolContext,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Listening");
    }

    let active_connections = Arc::new(Mutex::new(0usize));
    let (closing_tx, closing_rx) = watch::channel(false);
    let max_connections = ctx.config.server.max_connections;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server. Waiting for connections to close...");
                let _ = closing_tx.send(true);

                let timeout = tokio::time::sleep(ctx.config.server.shutdown_timeout);
                tokio::pin!(timeout);

                loop {
                    let connections = *active_connections.lock().await;
                    if connections == 0 {
                        info!("All connections closed, shutting down");
                        break;
                    }
                    tokio::select! {
                        _ = &mut timeout => {
                            warn!(connections, "Shutdown timeout reached, forcing exit");
                            break;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {
                            debug!(connections, "Waiting for connections to close");
                        }
                    }
                }

                ctx.metrics.log_metrics();
                return Ok(());
            }

            accept_result = listener.accept() => {
                let (stream, addr) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        continue;
                    }
                };

                {
                    let mut count = active_connections.lock().await;
                    if *count >= max_connections {
                        warn!(peer = %addr, limit = max_connections, "Connection limit reached");
                        ctx.metrics.connection_rejected();
                        continue;
                    }
                    *count += 1;
                }

                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }

                let ctx = ctx.clone();
                let dispatcher = Arc::clone(&dispatcher);
                let active_connections = Arc::clone(&active_connections);
                let closing = closing_rx.clone();

                tokio::spawn(async move {
                    let pending = PendingConnection::new(stream, &ctx);
                    let handle = pending.handle();
                    let session = serve_connection(pending, &dispatcher);
                    tokio::pin!(session);

                    let finished = tokio::select! {
                        result = &mut session => Some(result),
                        _ = wait_for_close(closing) => None,
                    };
                    // On shutdown, ask the connection to close and let it wind down.
                    let result = match finished {
                        Some(result) => result,
                        None => {
                            handle.close();
                            session.await
                        }
                    };
                    if let Err(e) = result {
                        warn!(peer = %addr, error = %e, "Connection ended with error");
                    }

                    let mut count = active_connections.lock().await;
                    *count -= 1;
                    info!(peer = %addr, "Connection closed");
                });
            }
        }
    }
}

async fn serve_connection(
    pending: PendingConnection<TcpStream>,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let mut connection = pending.accept().await?;
    debug!(
        version = connection.handshake().version(),
        client = ?connection.handshake().client_type(),
        "Serving"
    );
    let served = connection.serve(dispatcher).await;
    let closed = connection.close().await;
    served.and(closed)
}

async fn wait_for_close(mut closing: watch::Receiver<bool>) {
    while !*closing.borrow_and_update() {
        if closing.changed().await.is_err() {
            break;
        }
    }
}

/// Open a TCP connection and perform the client side of the handshake.
///
/// The connect attempt is bounded by `client.connection_timeout`.
#[instrument(skip(ctx, handshake))]
pub async fn connect<A>(
    addr: A,
    ctx: &ProtocolContext,
    handshake: Handshake,
) -> Result<Connection<TcpStream>>
where
    A: ToSocketAddrs + std::fmt::Debug,
{
    let stream = with_timeout_error(
        async { Ok(TcpStream::connect(addr).await?) },
        ctx.config.client.connection_timeout,
    )
    .await?;
    stream.set_nodelay(true)?;

    Connection::connect(stream, ctx, handshake).await
}
