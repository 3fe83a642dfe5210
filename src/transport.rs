use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use crate::client::ClientProxy;
use crate::common::{
    EvalResult, FitResult, ModelParameters, RoundConfig, Scalar, Tensor,
};
use crate::error::FedError;
use crate::proto;
use crate::proto::federated_client_client::FederatedClientClient;

// ---- proto <-> domain conversions ----

impl From<&Tensor> for proto::Tensor {
    fn from(t: &Tensor) -> Self {
        proto::Tensor {
            shape: t.shape.iter().map(|&s| s as u64).collect(),
            values: t.values.clone(),
        }
    }
}

impl From<proto::Tensor> for Tensor {
    fn from(t: proto::Tensor) -> Self {
        Tensor {
            shape: t.shape.iter().map(|&s| s as usize).collect(),
            values: t.values,
        }
    }
}

impl From<&ModelParameters> for proto::ModelParameters {
    fn from(p: &ModelParameters) -> Self {
        proto::ModelParameters {
            tensors: p.tensors.iter().map(proto::Tensor::from).collect(),
        }
    }
}

impl From<proto::ModelParameters> for ModelParameters {
    fn from(p: proto::ModelParameters) -> Self {
        ModelParameters {
            tensors: p.tensors.into_iter().map(Tensor::from).collect(),
        }
    }
}

impl From<&Scalar> for proto::ConfigValue {
    fn from(s: &Scalar) -> Self {
        use proto::config_value::Kind;
        let kind = match s {
            Scalar::Bool(v) => Kind::BoolVal(*v),
            Scalar::Int(v) => Kind::IntVal(*v),
            Scalar::Float(v) => Kind::DoubleVal(*v),
            Scalar::Str(v) => Kind::StringVal(v.clone()),
        };
        proto::ConfigValue { kind: Some(kind) }
    }
}

impl From<&RoundConfig> for proto::RoundConfig {
    fn from(c: &RoundConfig) -> Self {
        proto::RoundConfig {
            values: c
                .values()
                .iter()
                .map(|(k, v)| (k.clone(), proto::ConfigValue::from(v)))
                .collect(),
        }
    }
}

impl From<proto::RoundConfig> for RoundConfig {
    fn from(c: proto::RoundConfig) -> Self {
        use proto::config_value::Kind;
        let values: HashMap<String, Scalar> = c
            .values
            .into_iter()
            .filter_map(|(k, v)| {
                let scalar = match v.kind? {
                    Kind::BoolVal(v) => Scalar::Bool(v),
                    Kind::IntVal(v) => Scalar::Int(v),
                    Kind::DoubleVal(v) => Scalar::Float(v),
                    Kind::StringVal(v) => Scalar::Str(v),
                };
                Some((k, scalar))
            })
            .collect();
        RoundConfig::from_values(values)
    }
}

fn fed_error_to_status(e: &FedError) -> Status {
    match e {
        FedError::ShapeMismatch { .. } => Status::invalid_argument(e.to_string()),
        FedError::Configuration(_) => Status::failed_precondition(e.to_string()),
        _ => Status::internal(e.to_string()),
    }
}

fn status_to_fed_error(id: &str, status: Status) -> FedError {
    // Only a status minted from a real shape mismatch maps back to one; any
    // other InvalidArgument (e.g. a request missing its parameters) keeps its
    // message as an unavailability reason.
    if status.code() == tonic::Code::InvalidArgument
        && status.message().starts_with("tensor shape mismatch")
    {
        return FedError::ShapeMismatch {
            layer: 0,
            expected: Vec::new(),
            actual: Vec::new(),
        };
    }
    FedError::ClientUnavailable {
        id: id.to_string(),
        reason: status.message().to_string(),
    }
}

// ---- aggregator-side proxy for a remote client ----

/// gRPC-backed [`ClientProxy`]: each call dials the client's advertised
/// address over a lazily-connected channel. Transport failures surface as
/// `ClientUnavailable` for the round in which they happen.
pub struct RemoteClient {
    id: String,
    channel: Channel,
}

impl RemoteClient {
    pub fn new(id: impl Into<String>, address: &str) -> Result<Self, FedError> {
        let id = id.into();
        let endpoint = Endpoint::from_shared(format!("http://{}", address)).map_err(|e| {
            FedError::ClientUnavailable {
                id: id.clone(),
                reason: format!("invalid address {}: {}", address, e),
            }
        })?;
        Ok(Self {
            id,
            channel: endpoint.connect_lazy(),
        })
    }

    fn client(&self) -> FederatedClientClient<Channel> {
        FederatedClientClient::new(self.channel.clone())
    }

    fn unavailable(&self, reason: impl ToString) -> FedError {
        FedError::ClientUnavailable {
            id: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Tells the remote process to stop serving; best-effort.
    pub async fn shutdown(&self) -> Result<(), FedError> {
        self.client()
            .shutdown(Request::new(proto::ShutdownRequest {}))
            .await
            .map_err(|s| status_to_fed_error(&self.id, s))?;
        Ok(())
    }
}

#[tonic::async_trait]
impl ClientProxy for RemoteClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_parameters(&self) -> Result<ModelParameters, FedError> {
        let response = self
            .client()
            .get_parameters(Request::new(proto::GetParametersRequest {}))
            .await
            .map_err(|s| status_to_fed_error(&self.id, s))?;
        response
            .into_inner()
            .parameters
            .map(ModelParameters::from)
            .ok_or_else(|| self.unavailable("empty get_parameters response"))
    }

    async fn set_parameters(&self, params: &ModelParameters) -> Result<(), FedError> {
        self.client()
            .set_parameters(Request::new(proto::SetParametersRequest {
                parameters: Some(params.into()),
            }))
            .await
            .map_err(|s| status_to_fed_error(&self.id, s))?;
        Ok(())
    }

    async fn fit(
        &self,
        params: &ModelParameters,
        config: &RoundConfig,
    ) -> Result<FitResult, FedError> {
        let response = self
            .client()
            .fit(Request::new(proto::FitRequest {
                parameters: Some(params.into()),
                config: Some(config.into()),
            }))
            .await
            .map_err(|s| status_to_fed_error(&self.id, s))?
            .into_inner();
        Ok(FitResult {
            parameters: response.parameters.map(ModelParameters::from),
            num_examples: response.num_examples,
            metrics: response.metrics,
        })
    }

    async fn evaluate(
        &self,
        params: &ModelParameters,
        config: &RoundConfig,
    ) -> Result<EvalResult, FedError> {
        let response = self
            .client()
            .evaluate(Request::new(proto::EvaluateRequest {
                parameters: Some(params.into()),
                config: Some(config.into()),
            }))
            .await
            .map_err(|s| status_to_fed_error(&self.id, s))?
            .into_inner();
        Ok(EvalResult {
            loss: response.loss,
            num_examples: response.num_examples,
            metrics: response.metrics,
        })
    }
}

// ---- client-side gRPC service ----

/// Serves one local client over gRPC until a Shutdown RPC arrives. The
/// oneshot sender feeds `serve_with_shutdown` in the client binary.
pub struct ClientService {
    inner: Arc<dyn ClientProxy>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl ClientService {
    pub fn new(inner: Arc<dyn ClientProxy>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            shutdown: Mutex::new(Some(shutdown)),
        }
    }
}

#[tonic::async_trait]
impl proto::federated_client_server::FederatedClient for ClientService {
    async fn get_parameters(
        &self,
        _request: Request<proto::GetParametersRequest>,
    ) -> Result<Response<proto::GetParametersResponse>, Status> {
        let params = self
            .inner
            .get_parameters()
            .await
            .map_err(|e| fed_error_to_status(&e))?;
        Ok(Response::new(proto::GetParametersResponse {
            parameters: Some((&params).into()),
        }))
    }

    async fn set_parameters(
        &self,
        request: Request<proto::SetParametersRequest>,
    ) -> Result<Response<proto::SetParametersResponse>, Status> {
        let params = request
            .into_inner()
            .parameters
            .ok_or_else(|| Status::invalid_argument("missing parameters"))?;
        self.inner
            .set_parameters(&params.into())
            .await
            .map_err(|e| fed_error_to_status(&e))?;
        Ok(Response::new(proto::SetParametersResponse {}))
    }

    async fn fit(
        &self,
        request: Request<proto::FitRequest>,
    ) -> Result<Response<proto::FitResponse>, Status> {
        let request = request.into_inner();
        let params: ModelParameters = request
            .parameters
            .ok_or_else(|| Status::invalid_argument("missing parameters"))?
            .into();
        let config: RoundConfig = request.config.unwrap_or_default().into();

        let result = self
            .inner
            .fit(&params, &config)
            .await
            .map_err(|e| fed_error_to_status(&e))?;
        Ok(Response::new(proto::FitResponse {
            parameters: result.parameters.as_ref().map(proto::ModelParameters::from),
            num_examples: result.num_examples,
            metrics: result.metrics,
        }))
    }

    async fn evaluate(
        &self,
        request: Request<proto::EvaluateRequest>,
    ) -> Result<Response<proto::EvaluateResponse>, Status> {
        let request = request.into_inner();
        let params: ModelParameters = request
            .parameters
            .ok_or_else(|| Status::invalid_argument("missing parameters"))?
            .into();
        let config: RoundConfig = request.config.unwrap_or_default().into();

        let result = self
            .inner
            .evaluate(&params, &config)
            .await
            .map_err(|e| fed_error_to_status(&e))?;
        Ok(Response::new(proto::EvaluateResponse {
            loss: result.loss,
            num_examples: result.num_examples,
            metrics: result.metrics,
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<proto::ShutdownRequest>,
    ) -> Result<Response<proto::ShutdownResponse>, Status> {
        info!("shutdown requested by aggregator");
        if let Some(sender) = self.shutdown.lock().unwrap().take() {
            let _ = sender.send(());
        }
        Ok(Response::new(proto::ShutdownResponse {}))
    }
}

// ---- aggregator-side registration service ----

#[derive(Debug, Clone)]
pub struct Registration {
    pub client_id: String,
    pub address: String,
}

/// Shared log of clients that have announced themselves.
#[derive(Default)]
pub struct RegistrationLog {
    entries: Mutex<Vec<Registration>>,
}

impl RegistrationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<Registration> {
        self.entries.lock().unwrap().clone()
    }

    fn insert(&self, registration: Registration) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|r| r.client_id == registration.client_id) {
            return false;
        }
        entries.push(registration);
        true
    }
}

pub struct AggregatorService {
    log: Arc<RegistrationLog>,
}

impl AggregatorService {
    pub fn new(log: Arc<RegistrationLog>) -> Self {
        Self { log }
    }
}

#[tonic::async_trait]
impl proto::aggregator_server::Aggregator for AggregatorService {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let request = request.into_inner();
        if request.client_id.is_empty() || request.address.is_empty() {
            return Err(Status::invalid_argument("client_id and address are required"));
        }

        let accepted = self.log.insert(Registration {
            client_id: request.client_id.clone(),
            address: request.address,
        });
        let message = if accepted {
            info!("registered client {}", request.client_id);
            format!("client {} registered", request.client_id)
        } else {
            format!("client {} already registered", request.client_id)
        };
        Ok(Response::new(proto::RegisterResponse { accepted, message }))
    }
}
