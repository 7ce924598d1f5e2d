use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::auth::{TokenVerifier, ELEVATED_RIGHT};
use super::protocol::{
    ExecuteParams, ExecuteResult, RpcRequest, RpcResponse, VersionResult, EXECUTION_FAILED,
    INVALID_PARAMS, METHOD_EXECUTE, METHOD_NOT_FOUND, METHOD_PING, METHOD_VERSION, UNAUTHORIZED,
};
use super::{HelperError, HelperHealth, RemoteExecutor, RemoteOutput, RemoteRequest};
use crate::runner::{CommandRunner, OutputSink, RunRequest};

/// Builds the runner for one call, so cancelling one connection never
/// touches another.
pub type RunnerFactory = Arc<dyn Fn() -> Arc<dyn CommandRunner> + Send + Sync>;

/// The helper's entire surface: execute, ping, version.
pub struct HelperService {
    runners: RunnerFactory,
    verifier: TokenVerifier,
    max_runtime: Duration,
    version: String,
}

impl HelperService {
    pub fn new(runners: RunnerFactory, verifier: TokenVerifier, max_runtime: Duration) -> Self {
        Self {
            runners,
            verifier,
            max_runtime,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Report a different version; used to exercise upgrade paths.
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn execute(
        &self,
        params: ExecuteParams,
        cancel: CancellationToken,
    ) -> Result<ExecuteResult, HelperError> {
        self.verifier
            .verify(&params.auth_token, ELEVATED_RIGHT)
            .map_err(|e| HelperError::Unauthorized(e.to_string()))?;

        if !Path::new(&params.program).is_absolute() {
            return Err(HelperError::InvalidRequest(format!(
                "executable must be an absolute path: {}",
                params.program
            )));
        }
        if let Some(ref dir) = params.working_dir {
            if !Path::new(dir).is_absolute() {
                return Err(HelperError::InvalidRequest(format!(
                    "working directory must be absolute: {}",
                    dir
                )));
            }
        }

        let timeout = Duration::from_millis(params.timeout_ms).min(self.max_runtime);
        log::info!(
            "Helper executing '{}' with {} arg(s), timeout {:?}",
            params.program,
            params.args.len(),
            timeout
        );

        let runner = (self.runners)();
        // A client hang-up cancels the token and terminates the command.
        let output = runner
            .run(
                RunRequest {
                    program: params.program,
                    args: params.args,
                    working_dir: params.working_dir.map(PathBuf::from),
                    timeout,
                    cancel: cancel.child_token(),
                },
                OutputSink::none(),
            )
            .await
            .map_err(|e| HelperError::Execution(e.to_string()))?;

        Ok(ExecuteResult {
            status: output.status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Answer one JSON-RPC request. Never fails; errors become error responses.
    pub async fn dispatch(&self, request: RpcRequest, cancel: CancellationToken) -> RpcResponse {
        let id = request.id;
        match request.method.as_str() {
            METHOD_PING => RpcResponse::ok(id, Value::String("pong".into())),
            METHOD_VERSION => match serde_json::to_value(VersionResult {
                version: self.version.clone(),
            }) {
                Ok(v) => RpcResponse::ok(id, v),
                Err(e) => RpcResponse::err(id, EXECUTION_FAILED, e.to_string()),
            },
            METHOD_EXECUTE => {
                let params: ExecuteParams = match serde_json::from_value(request.params) {
                    Ok(p) => p,
                    Err(e) => return RpcResponse::err(id, INVALID_PARAMS, e.to_string()),
                };
                match self.execute(params, cancel).await {
                    Ok(result) => match serde_json::to_value(result) {
                        Ok(v) => RpcResponse::ok(id, v),
                        Err(e) => RpcResponse::err(id, EXECUTION_FAILED, e.to_string()),
                    },
                    Err(e) => {
                        log::warn!("Helper rejected execute: {}", e);
                        RpcResponse::err(id, error_code(&e), e.to_string())
                    }
                }
            }
            other => RpcResponse::err(id, METHOD_NOT_FOUND, format!("unknown method '{}'", other)),
        }
    }
}

fn error_code(error: &HelperError) -> i64 {
    match error {
        HelperError::Unauthorized(_) => UNAUTHORIZED,
        HelperError::InvalidRequest(_) => INVALID_PARAMS,
        _ => EXECUTION_FAILED,
    }
}

/// Map an error response back onto [`HelperError`].
pub(crate) fn response_error(code: i64, message: String) -> HelperError {
    match code {
        UNAUTHORIZED => HelperError::Unauthorized(message),
        INVALID_PARAMS => HelperError::InvalidRequest(message),
        EXECUTION_FAILED => HelperError::Execution(message),
        _ => HelperError::Protocol(format!("{} ({})", message, code)),
    }
}

/// Decode a response into `T`, mapping error responses.
pub(crate) fn decode_response<T: serde::de::DeserializeOwned>(
    response: RpcResponse,
) -> Result<T, HelperError> {
    if let Some(err) = response.error {
        return Err(response_error(err.code, err.message));
    }
    let result = response
        .result
        .ok_or_else(|| HelperError::Protocol("response carries neither result nor error".into()))?;
    serde_json::from_value(result).map_err(|e| HelperError::Protocol(e.to_string()))
}

pub(crate) fn execute_params(request: RemoteRequest) -> ExecuteParams {
    ExecuteParams {
        program: request.program,
        args: request.args,
        working_dir: request
            .working_dir
            .map(|d| d.to_string_lossy().into_owned()),
        timeout_ms: request.timeout.as_millis() as u64,
        auth_token: request.auth_token,
    }
}

impl From<ExecuteResult> for RemoteOutput {
    fn from(result: ExecuteResult) -> Self {
        RemoteOutput {
            status: result.status,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }
}

/// [`RemoteExecutor`] that dispatches straight into a [`HelperService`],
/// through the same JSON-RPC messages the socket carries.
pub struct InProcessHelper {
    service: Arc<HelperService>,
    health: Mutex<Option<HelperHealth>>,
    rpc_calls: AtomicU64,
}

impl InProcessHelper {
    pub fn new(service: Arc<HelperService>) -> Self {
        Self {
            service,
            health: Mutex::new(None),
            rpc_calls: AtomicU64::new(0),
        }
    }

    /// Report `health` instead of asking the service.
    pub fn with_health(self, health: HelperHealth) -> Self {
        if let Ok(mut slot) = self.health.lock() {
            *slot = Some(health);
        }
        self
    }

    /// Number of RPCs dispatched so far, health checks included.
    pub fn rpc_calls(&self) -> u64 {
        self.rpc_calls.load(Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Value, cancel: CancellationToken) -> RpcResponse {
        let id = self.rpc_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.service
            .dispatch(RpcRequest::new(method, params, id), cancel)
            .await
    }
}

#[async_trait]
impl RemoteExecutor for InProcessHelper {
    async fn health(&self) -> Result<HelperHealth, HelperError> {
        let forced = self
            .health
            .lock()
            .map_err(|_| HelperError::Protocol("health lock poisoned".into()))?
            .clone();
        if let Some(health) = forced {
            return Ok(health);
        }
        let response = self
            .call(METHOD_VERSION, Value::Null, CancellationToken::new())
            .await;
        let version: VersionResult = decode_response(response)?;
        Ok(HelperHealth::Ready {
            version: version.version,
        })
    }

    async fn run(
        &self,
        request: RemoteRequest,
        cancel: CancellationToken,
    ) -> Result<RemoteOutput, HelperError> {
        let params = serde_json::to_value(execute_params(request))
            .map_err(|e| HelperError::Protocol(e.to_string()))?;
        let response = self.call(METHOD_EXECUTE, params, cancel).await;
        let result: ExecuteResult = decode_response(response)?;
        Ok(result.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::auth::{Authorizer, LocalAuthority};
    use crate::runner::mock::MockRunner;
    use crate::runner::ExecutionStatus;

    fn service_with(runner: Arc<MockRunner>, authority: &LocalAuthority) -> HelperService {
        let factory: RunnerFactory = Arc::new(move || runner.clone() as Arc<dyn CommandRunner>);
        HelperService::new(factory, authority.verifier(), Duration::from_secs(60))
    }

    fn params(program: &str, token: String) -> ExecuteParams {
        ExecuteParams {
            program: program.into(),
            args: vec!["-v".into()],
            working_dir: None,
            timeout_ms: 120_000,
            auth_token: token,
        }
    }

    #[tokio::test]
    async fn executes_with_valid_token_and_caps_timeout() {
        let authority = LocalAuthority::generate(Duration::from_secs(30));
        let runner = Arc::new(MockRunner::new().with_exit(0, "purged\n"));
        let service = service_with(runner.clone(), &authority);

        let token = authority.authorize(ELEVATED_RIGHT).unwrap();
        let result = service
            .execute(params("/usr/sbin/purge", token), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "purged\n");
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "/usr/sbin/purge");
        assert_eq!(calls[0].timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn relative_program_is_refused() {
        let authority = LocalAuthority::generate(Duration::from_secs(30));
        let runner = Arc::new(MockRunner::new());
        let service = service_with(runner.clone(), &authority);

        let token = authority.authorize(ELEVATED_RIGHT).unwrap();
        let err = service
            .execute(params("purge", token), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HelperError::InvalidRequest(_)));
        assert!(!runner.was_called());
    }

    #[tokio::test]
    async fn bad_token_never_reaches_the_runner() {
        let authority = LocalAuthority::generate(Duration::from_secs(30));
        let other = LocalAuthority::generate(Duration::from_secs(30));
        let runner = Arc::new(MockRunner::new());
        let service = service_with(runner.clone(), &authority);

        let token = other.authorize(ELEVATED_RIGHT).unwrap();
        let response = service
            .dispatch(
                RpcRequest::new(
                    METHOD_EXECUTE,
                    serde_json::to_value(params("/usr/sbin/purge", token)).unwrap(),
                    3,
                ),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.id, 3);
        assert_eq!(response.error.unwrap().code, UNAUTHORIZED);
        assert!(!runner.was_called());
    }

    #[tokio::test]
    async fn ping_version_and_unknown_method() {
        let authority = LocalAuthority::generate(Duration::from_secs(30));
        let service = service_with(Arc::new(MockRunner::new()), &authority).with_version("9.9.9");
        let none = CancellationToken::new;

        let pong = service.dispatch(RpcRequest::new(METHOD_PING, Value::Null, 1), none()).await;
        assert_eq!(pong.result, Some(Value::String("pong".into())));

        let version: VersionResult = decode_response(
            service.dispatch(RpcRequest::new(METHOD_VERSION, Value::Null, 2), none()).await,
        )
        .unwrap();
        assert_eq!(version.version, "9.9.9");

        let unknown = service
            .dispatch(RpcRequest::new("helper.shell", Value::Null, 3), none())
            .await;
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn in_process_helper_counts_rpcs() {
        let authority = LocalAuthority::generate(Duration::from_secs(30));
        let service = Arc::new(service_with(Arc::new(MockRunner::new()), &authority));
        let helper = InProcessHelper::new(service);

        assert!(matches!(helper.health().await.unwrap(), HelperHealth::Ready { .. }));
        let out = helper
            .run(
                RemoteRequest {
                    program: "/usr/sbin/purge".into(),
                    args: Vec::new(),
                    working_dir: None,
                    timeout: Duration::from_secs(5),
                    auth_token: authority.authorize(ELEVATED_RIGHT).unwrap(),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(helper.rpc_calls(), 2);

        let forced = InProcessHelper::new(Arc::new(service_with(
            Arc::new(MockRunner::new()),
            &authority,
        )))
        .with_health(HelperHealth::NotInstalled);
        assert_eq!(forced.health().await.unwrap(), HelperHealth::NotInstalled);
        assert_eq!(forced.rpc_calls(), 0);
    }
}
