use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::engine::{
    BoxFuture, ChatTurn, CompletionHandle, CompletionRequest, CompletionsFailedSnafu, DeltaEvent,
    EmptyMessageSetSnafu, EngineError, EngineHandle, EngineResult, EngineWorker, HttpClientSnafu,
    InferenceEngine, MissingModelSnafu, ModelFetchStatusSnafu, ModelPayloadParseSnafu,
    ProgressSink, Role, make_delta_stream,
};

pub const RIG_ENGINE_ID: &str = "rig-openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::completion::streaming::StreamingCompletionResponse,
>;

/// Connection settings for an OpenAI-compatible endpoint, such as a local llama.cpp server.
#[derive(Debug, Clone, PartialEq)]
pub struct RigEngineConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model_id: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl RigEngineConfig {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            model_id: model_id.into().trim().to_string(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

pub struct RigEngine {
    config: RigEngineConfig,
}

impl RigEngine {
    pub fn new(config: RigEngineConfig) -> EngineResult<Self> {
        ensure!(
            !config.model_id.is_empty(),
            MissingModelSnafu {
                stage: "rig-engine-new",
            }
        );

        Ok(Self { config })
    }

    /// Local servers speak Chat Completions, not the Responses API.
    fn build_client(config: &RigEngineConfig) -> EngineResult<openai::CompletionsClient> {
        // Local servers usually ignore the key, but the client refuses an empty one.
        let api_key = if config.api_key.is_empty() {
            "local"
        } else {
            config.api_key.as_str()
        };
        let mut builder = openai::Client::builder().api_key(api_key);
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        let client = builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })?;
        Ok(client.completions_api())
    }

    async fn fetch_model_ids(client: &openai::CompletionsClient) -> EngineResult<Vec<String>> {
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| EngineError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let model_ids = extract_model_ids(&payload)?;
        if model_ids.is_empty() {
            return ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in endpoint response".to_string(),
            }
            .fail();
        }

        Ok(model_ids)
    }

    async fn load(config: RigEngineConfig, progress: ProgressSink) -> EngineResult<Arc<dyn EngineHandle>> {
        progress.report(format!("Connecting to {}", display_endpoint(&config)));
        let client = Self::build_client(&config)?;

        progress.report("Fetching model list...");
        let model_ids = Self::fetch_model_ids(&client).await?;
        if !model_ids.iter().any(|id| id == &config.model_id) {
            // Some servers expose file names instead of model ids; the request may still work.
            tracing::warn!(
                model_id = %config.model_id,
                available = model_ids.len(),
                "configured model is not listed by the endpoint"
            );
        }

        progress.report(format!("Model {} is available", config.model_id));
        Ok(Arc::new(RigEngineHandle { config }))
    }
}

impl InferenceEngine for RigEngine {
    fn id(&self) -> &str {
        RIG_ENGINE_ID
    }

    fn initialize(
        &self,
        progress: ProgressSink,
    ) -> BoxFuture<'static, EngineResult<Arc<dyn EngineHandle>>> {
        Box::pin(Self::load(self.config.clone(), progress))
    }
}

struct RigEngineHandle {
    config: RigEngineConfig,
}

impl RigEngineHandle {
    fn to_rig_message(turn: &ChatTurn) -> Option<RigMessage> {
        match turn.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(turn.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(turn.content.clone())),
        }
    }

    fn merged_preamble(config: &RigEngineConfig, request: &CompletionRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(prompt) = &config.system_prompt
            && !prompt.trim().is_empty()
        {
            preamble_parts.push(prompt.clone());
        }

        // Rig has a single preamble field, so system turns are folded into it.
        for turn in &request.messages {
            if matches!(turn.role, Role::System) && !turn.content.trim().is_empty() {
                preamble_parts.push(turn.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &RigEngineConfig,
        request: &CompletionRequest,
    ) -> EngineResult<RigStreamingResponse> {
        let client = RigEngine::build_client(config)?;
        let model = client.completion_model(config.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %config.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(config, request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = config.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<DeltaEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(DeltaEvent::Delta(text.text))
            }
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: RigEngineConfig,
        request: CompletionRequest,
        event_tx: mpsc::UnboundedSender<DeltaEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    model_id = %config.model_id,
                    error = %error,
                    "failed to open completion stream"
                );
                let _ = event_tx.send(DeltaEvent::Error(error.to_string()));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(model_id = %config.model_id, "completion stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(event) = Self::map_stream_item(item)
                                && event_tx.send(event).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(error = %source, "completion stream emitted an error chunk");
                            let error = EngineError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            let _ = event_tx.send(DeltaEvent::Error(error.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(DeltaEvent::Done);
    }
}

impl EngineHandle for RigEngineHandle {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn complete(&self, request: CompletionRequest) -> EngineResult<CompletionHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "rig-complete",
            }
        );

        let (event_tx, stream, cancel_rx) = make_delta_stream();
        let worker: EngineWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(CompletionHandle { stream, worker })
    }
}

fn display_endpoint(config: &RigEngineConfig) -> &str {
    if config.endpoint.is_empty() {
        "the default endpoint"
    } else {
        &config.endpoint
    }
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Reads the ids of an OpenAI-style `{"data":[{"id":..}]}` model list.
fn extract_model_ids(payload: &str) -> EngineResult<Vec<String>> {
    let list: ModelList =
        serde_json::from_str(payload).map_err(|source| EngineError::ModelPayloadParse {
            stage: "decode-model-list",
            details: source.to_string(),
        })?;

    let mut ids = list
        .data
        .into_iter()
        .map(|entry| entry.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    Ok(ids)
}
