//! Unix-socket front end of the helper. One request per connection.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{read_message, write_message, RpcRequest, RpcResponse, PARSE_ERROR};
use super::service::HelperService;

/// Bind `path`, replacing a stale socket left by a previous run.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    }
    Ok(listener)
}

/// Accept connections until `shutdown` fires.
pub async fn serve(
    listener: UnixListener,
    service: Arc<HelperService>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    log::info!("Helper {} accepting connections", service.version());
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => accepted?.0,
            _ = shutdown.cancelled() => {
                log::info!("Helper shutting down");
                return Ok(());
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, service).await {
                log::warn!("Helper connection failed: {}", e);
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<HelperService>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request: RpcRequest = match read_message(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) => {
            let response = RpcResponse::err(0, PARSE_ERROR, e.to_string());
            return write_message(&mut write_half, &response).await;
        }
    };

    // EOF on the read side after the request means the client gave up.
    let hangup = CancellationToken::new();
    let watcher = {
        let hangup = hangup.clone();
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            loop {
                match reader.read(&mut byte).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            hangup.cancel();
        })
    };

    let response = service.dispatch(request, hangup.clone()).await;
    watcher.abort();

    // A half-closed client still reads the reply; a fully closed one does not.
    if let Err(e) = write_message(&mut write_half, &response).await {
        log::debug!("Client left before the reply was written: {}", e);
    }
    Ok(())
}
