//! Static TCP forwarder ingress
//!
//! One accept loop per `listen/target` rule. Each accepted connection
//! becomes a logical connection on the shared pool, with up to 32 KiB
//! of initial client bytes (typically a TLS ClientHello) captured and
//! shipped inside the OPEN so the relay can reach the origin without
//! an extra round trip.

use super::{pipe_upstream, tune_socket, FIRST_FRAME_LIMIT, FIRST_FRAME_TIMEOUT};
use crate::config::ForwardRule;
use crate::ingress::IngressError;
use crate::pool::{wait_connected, EchPool, CONNECT_TIMEOUT};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Run the accept loop for one forwarding rule.
pub async fn run(rule: ForwardRule, pool: Arc<EchPool>) -> crate::Result<()> {
    let listener = TcpListener::bind(&rule.listen).await.map_err(|e| {
        crate::Error::Config(format!("cannot listen on {}: {}", rule.listen, e))
    })?;
    info!(listen = %rule.listen, target = %rule.target, "tcp forwarder listening");
    serve(listener, rule.target, pool).await
}

/// Accept loop of one forwarder, over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    target: String,
    pool: Arc<EchPool>,
) -> crate::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, target = %target, "forwarder connection accepted");

        let pool = Arc::clone(&pool);
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, &target, &pool).await {
                debug!(%peer, error = %e, "forwarder connection ended");
            }
        });
    }
}

async fn handle(mut stream: TcpStream, target: &str, pool: &EchPool) -> Result<(), IngressError> {
    let cid = Uuid::new_v4().to_string();

    // Capture whatever the client sends first; silence within the
    // deadline is not an error (some protocols expect the server to
    // speak first).
    let mut first = vec![0u8; FIRST_FRAME_LIMIT];
    let n = match tokio::time::timeout(FIRST_FRAME_TIMEOUT, stream.read(&mut first)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => 0,
    };

    tune_socket(&stream);
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    let signal = pool
        .register_and_claim(&cid, target, &first[..n], writer)
        .await?;

    if !wait_connected(signal, CONNECT_TIMEOUT).await {
        warn!(%cid, target, "remote connect timed out");
        pool.send_close(&cid).await;
        pool.remove(&cid);
        return Err(IngressError::ConnectTimeout);
    }

    pipe_upstream(read_half, pool, &cid).await;
    Ok(())
}
