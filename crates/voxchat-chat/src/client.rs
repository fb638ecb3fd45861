use crate::request::{build_request, RequestOptions};
use crate::stream::{consume_events, ChatEvent};
use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use voxchat_core::{
    ChatConfig, ChatError, ChatVendor, ConversationTurn, ErrorClassifier, MessagesConfig,
    TransportError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Streaming client for an OpenAI-compatible chat completions endpoint.
///
/// At most one request is in flight per client. Events for every request go
/// to the single receiver returned by [`ChatClient::take_event_receiver`].
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    vendor: ChatVendor,
    defaults: RequestOptions,
    idle_timeout: Duration,
    classifier: Arc<ErrorClassifier>,
    in_flight: Arc<AtomicBool>,
    cancel: Mutex<Option<Arc<Notify>>>,
    event_tx: mpsc::UnboundedSender<ChatEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ChatEvent>>,
}

impl ChatClient {
    pub fn new(config: &ChatConfig, messages: MessagesConfig) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ChatError::ClientBuild(e.to_string()))?;

        let base_url = config.effective_base_url();
        let api_key = config.api_key.trim().to_string();
        if config.vendor == ChatVendor::DashScope && !api_key.is_empty() && !api_key.starts_with("sk-") {
            warn!("DashScope API keys normally start with \"sk-\"");
        }
        debug!(base_url = %base_url, vendor = ?config.vendor, "chat client created");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            http,
            base_url,
            api_key,
            vendor: config.vendor,
            defaults: RequestOptions::from_config(config),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            classifier: Arc::new(ErrorClassifier::new(messages)),
            in_flight: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ChatEvent>> {
        self.event_rx.take()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn vendor(&self) -> ChatVendor {
        self.vendor
    }

    /// Options built from the configuration, a starting point for `send`.
    pub fn default_options(&self) -> RequestOptions {
        self.defaults.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start a streaming completion for `turns`.
    ///
    /// Configuration problems are returned here and nothing is emitted.
    /// Everything after the request leaves is reported through events,
    /// ending with exactly one terminal event.
    pub fn send(&self, turns: &[ConversationTurn], options: &RequestOptions) -> Result<(), ChatError> {
        let headers = self.headers()?;
        let url = self.endpoint()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ChatError::ClientBuild(format!("no async runtime: {}", e)))?;

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChatError::AlreadyStreaming);
        }

        let body = build_request(turns, options);
        info!(
            model = %options.model,
            messages = turns.len(),
            tools = options.tools.len(),
            "sending completion request"
        );
        let request = self.http.post(url).headers(headers).json(&body);

        let cancel = Arc::new(Notify::new());
        *lock(&self.cancel) = Some(cancel.clone());

        let events = self.event_tx.clone();
        let classifier = self.classifier.clone();
        let in_flight = self.in_flight.clone();
        let idle_timeout = self.idle_timeout;
        runtime.spawn(async move {
            let terminal = run_request(request, &cancel, &events, &classifier, idle_timeout).await;
            in_flight.store(false, Ordering::Release);
            let _ = events.send(terminal);
        });
        Ok(())
    }

    /// Cancel the request in flight. The listener sees `Finished(false)`.
    pub fn stop(&self) {
        if let Some(cancel) = lock(&self.cancel).take() {
            if self.is_streaming() {
                debug!("cancelling completion request");
                cancel.notify_one();
            }
        }
    }

    fn headers(&self) -> Result<HeaderMap, ChatError> {
        if self.api_key.is_empty() {
            return Err(ChatError::CredentialMissing);
        }
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ChatError::CredentialMalformed(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        Ok(headers)
    }

    fn endpoint(&self) -> Result<reqwest::Url, ChatError> {
        if self.base_url.is_empty() {
            return Err(ChatError::EndpointMisconfigured("base URL is empty".to_string()));
        }
        let url = reqwest::Url::parse(&format!("{}/chat/completions", self.base_url))
            .map_err(|e| ChatError::EndpointMisconfigured(format!("{}: {}", self.base_url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ChatError::EndpointMisconfigured(format!(
                "unsupported scheme \"{}\"",
                other
            ))),
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_request(
    request: reqwest::RequestBuilder,
    cancel: &Notify,
    events: &mpsc::UnboundedSender<ChatEvent>,
    classifier: &ErrorClassifier,
    idle_timeout: Duration,
) -> ChatEvent {
    // Headers and error bodies get the same silence budget as stream events
    let response = tokio::select! {
        biased;
        _ = cancel.notified() => return ChatEvent::Finished(false),
        response = timeout(idle_timeout, request.send()) => response,
    };
    let response = match response {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let err = transport_error(&e);
            error!("completion request failed: {}", err);
            return ChatEvent::Error(classifier.classify_transport(&err).user_message());
        }
        Err(_) => {
            warn!("no response headers for {}ms", idle_timeout.as_millis());
            return ChatEvent::Error(
                classifier
                    .classify_transport(&TransportError::Timeout)
                    .user_message(),
            );
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            biased;
            _ = cancel.notified() => return ChatEvent::Finished(false),
            body = timeout(idle_timeout, response.text()) => match body {
                Ok(body) => body.unwrap_or_default(),
                Err(_) => {
                    warn!(status = status.as_u16(), "error body did not arrive in time");
                    String::new()
                }
            },
        };
        let classification = classifier.classify(Some(status.as_u16()), Some(&body), None);
        error!(
            status = status.as_u16(),
            category = ?classification.category,
            "completion request rejected"
        );
        return ChatEvent::Error(classification.user_message());
    }

    let stream = response.bytes_stream().eventsource().map(|item| match item {
        Ok(event) => Ok(event.data),
        Err(e) => Err(event_stream_error(e)),
    });
    let (_, terminal) =
        consume_events(Box::pin(stream), cancel, events, classifier, idle_timeout).await;
    terminal
}

fn event_stream_error(e: EventStreamError<reqwest::Error>) -> TransportError {
    match e {
        EventStreamError::Transport(e) => transport_error(&e),
        other => TransportError::Other(other.to_string()),
    }
}

fn transport_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        return TransportError::Timeout;
    }
    let detail = error_chain(e);
    let lower = detail.to_ascii_lowercase();
    if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        TransportError::Tls(detail)
    } else if e.is_connect() {
        TransportError::Connect(detail)
    } else {
        TransportError::Other(detail)
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut detail = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        detail.push_str(": ");
        detail.push_str(&inner.to_string());
        source = inner.source();
    }
    detail
}
