use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    read_message, write_message, ExecuteResult, RpcRequest, RpcResponse, VersionResult,
    METHOD_EXECUTE, METHOD_PING, METHOD_VERSION,
};
use super::service::{decode_response, execute_params};
use super::{HelperError, HelperHealth, RemoteExecutor, RemoteOutput, RemoteRequest};
use crate::config::EngineConfig;
use crate::version;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Short queries (ping, version) must answer within this.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack on top of the command timeout, covering the helper's own
/// termination grace period and the reply.
const RESPONSE_MARGIN: Duration = Duration::from_secs(15);

/// [`RemoteExecutor`] talking to the installed helper over its socket.
pub struct HelperClient {
    socket_path: PathBuf,
    binary_path: PathBuf,
    required_version: String,
    next_id: AtomicU64,
}

impl HelperClient {
    pub fn new(socket_path: PathBuf, binary_path: PathBuf, required_version: &str) -> Self {
        Self {
            socket_path,
            binary_path,
            required_version: required_version.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.helper_socket_path(),
            config.helper_binary_path(),
            &config.helper.required_version,
        )
    }

    pub async fn ping(&self) -> Result<(), HelperError> {
        let pong: String = self.query(METHOD_PING).await?;
        if pong != "pong" {
            return Err(HelperError::Protocol(format!("unexpected ping reply '{}'", pong)));
        }
        Ok(())
    }

    pub async fn version(&self) -> Result<String, HelperError> {
        let result: VersionResult = self.query(METHOD_VERSION).await?;
        Ok(result.version)
    }

    async fn connect(&self) -> Result<UnixStream, HelperError> {
        match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(HelperError::Unreachable(format!(
                "{}: {}",
                self.socket_path.display(),
                e
            ))),
            Err(_) => Err(HelperError::Unreachable("connect timed out".into())),
        }
    }

    fn request(&self, method: &str, params: Value) -> RpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        RpcRequest::new(method, params, id)
    }

    async fn query<T: DeserializeOwned>(&self, method: &str) -> Result<T, HelperError> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        write_message(&mut write_half, &self.request(method, Value::Null))
            .await
            .map_err(|e| HelperError::Unreachable(e.to_string()))?;

        let mut reader = BufReader::new(read_half);
        let response = tokio::time::timeout(QUERY_TIMEOUT, read_message::<_, RpcResponse>(&mut reader))
            .await
            .map_err(|_| HelperError::Unreachable(format!("{} timed out", method)))?;
        decode_response(received(response)?)
    }
}

enum Waited {
    Reply(std::io::Result<Option<RpcResponse>>),
    Cancelled,
    Expired,
}

fn received(response: std::io::Result<Option<RpcResponse>>) -> Result<RpcResponse, HelperError> {
    match response {
        Ok(Some(response)) => Ok(response),
        Ok(None) => Err(HelperError::Unreachable(
            "helper closed the connection without replying".into(),
        )),
        Err(e) => Err(HelperError::Protocol(e.to_string())),
    }
}

#[async_trait]
impl RemoteExecutor for HelperClient {
    async fn health(&self) -> Result<HelperHealth, HelperError> {
        if !self.binary_path.exists() || !self.socket_path.exists() {
            log::debug!(
                "Helper binary {} or socket {} missing",
                self.binary_path.display(),
                self.socket_path.display()
            );
            return Ok(HelperHealth::NotInstalled);
        }

        self.ping().await?;
        let installed = self.version().await?;
        if version::at_least(&installed, &self.required_version) {
            Ok(HelperHealth::Ready { version: installed })
        } else {
            Ok(HelperHealth::Outdated {
                installed,
                required: self.required_version.clone(),
            })
        }
    }

    async fn run(
        &self,
        request: RemoteRequest,
        cancel: CancellationToken,
    ) -> Result<RemoteOutput, HelperError> {
        let deadline = request.timeout + RESPONSE_MARGIN;
        let params = serde_json::to_value(execute_params(request))
            .map_err(|e| HelperError::Protocol(e.to_string()))?;

        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        write_message(&mut write_half, &self.request(METHOD_EXECUTE, params))
            .await
            .map_err(|e| HelperError::Unreachable(e.to_string()))?;

        let mut reader = BufReader::new(read_half);
        let read = read_message::<_, RpcResponse>(&mut reader);
        tokio::pin!(read);
        let expired = tokio::time::sleep(deadline);
        tokio::pin!(expired);

        let waited = tokio::select! {
            biased;
            response = &mut read => Waited::Reply(response),
            _ = cancel.cancelled() => Waited::Cancelled,
            _ = &mut expired => Waited::Expired,
        };
        let response = match waited {
            Waited::Reply(response) => response,
            Waited::Cancelled => {
                // Half-close: the helper sees EOF, terminates the command and
                // still sends the final result.
                log::info!("Asking helper to cancel");
                let _ = write_half.shutdown().await;
                tokio::time::timeout(RESPONSE_MARGIN, read).await.map_err(|_| {
                    HelperError::Unreachable("helper did not confirm cancellation".into())
                })?
            }
            Waited::Expired => {
                return Err(HelperError::Unreachable(format!(
                    "no reply within {:?}",
                    deadline
                )));
            }
        };

        let result: ExecuteResult = decode_response(received(response)?)?;
        Ok(result.into())
    }
}
