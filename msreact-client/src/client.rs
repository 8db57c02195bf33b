//! A client session: connects to the instrument server, runs one algorithm and
//! wires instrument events and acquisition requests together.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    algorithm::AlgorithmRegistry,
    command::AcqRequest,
    config::ClientConfig,
    error::ClientError,
    executor::AcquisitionExecutor,
    instrument::{InstrumentClient, InstrumentEvent},
    instruments::InstrumentModel,
    manager::{
        AcquisitionQueues, AcquisitionRelay, AcquisitionRequestHandler, AlgorithmManager,
        ManagerSettings,
    },
    transport::{Transport, WebSocketTransport},
};

/// How long clean-up waits for the listening loop to notice the disconnect.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Forward instrument events to the running acquisition.
pub fn relay_events(relay: AcquisitionRelay) -> impl Fn(InstrumentEvent) + Send + Sync + 'static {
    move |event| match event {
        InstrumentEvent::Scan(scan) => relay.deliver_scan(scan),
        InstrumentEvent::FinishedAcquisition => {
            info!("Received finished acquisition message");
            relay.acquisition_ended();
        }
        InstrumentEvent::Error(message) => {
            error!(
                "Received error message from instrument: {}",
                message.as_deref().unwrap_or("<no details>")
            );
            relay.instrument_error(message);
        }
    }
}

/// Turns acquisition requests into instrument commands. A failed command is
/// reported back to the acquisition as an instrument error.
pub struct InstrumentRequestHandler<T: Transport> {
    client: Arc<InstrumentClient<T>>,
    relay: AcquisitionRelay,
    model: InstrumentModel,
}

impl<T: Transport> InstrumentRequestHandler<T> {
    pub const fn new(
        client: Arc<InstrumentClient<T>>,
        relay: AcquisitionRelay,
        model: InstrumentModel,
    ) -> Self {
        Self {
            client,
            relay,
            model,
        }
    }

    async fn execute(&self, request: AcqRequest) -> Result<(), ClientError> {
        match request {
            AcqRequest::RequestScan(request) => self.client.request_scan(&request).await?,
            AcqRequest::RequestRepeatingScan(params) => {
                self.client.request_repeating_scan(&params).await?;
            }
            AcqRequest::CancelRepeatingScan(params) => {
                self.client.cancel_repeating_scan(&params).await?;
            }
            AcqRequest::ReadyForAcquisitionStart(settings) => {
                if !self.model.supports(&settings.workflow) {
                    return Err(ClientError::UnsupportedWorkflow {
                        instrument: self.model.to_string(),
                        workflow: settings.workflow.name(),
                    });
                }
                self.client.subscribe_to_scans().await?;
                self.client.configure_acquisition(&settings).await?;
                if settings.workflow.is_acquisition_triggering() {
                    self.client.start_acquisition().await?;
                } else {
                    info!(
                        "Listening workflow, waiting for the instrument to start the acquisition"
                    );
                }
            }
            AcqRequest::RequestAcquisitionStop => self.client.stop_acquisition().await?,
            AcqRequest::Error(message) => error!("acquisition reported an error: {message}"),
            AcqRequest::UpdateDefaultScanParams(params) => {
                self.client.update_default_scan_params(&params).await?;
            }
            AcqRequest::SetScanLevel(range) => {
                if self.model == InstrumentModel::Mock {
                    self.client.set_ms_scan_level(range).await?;
                } else {
                    debug!("scan level only applies to mock servers, ignored");
                }
            }
            AcqRequest::SubscribeToScans => self.client.subscribe_to_scans().await?,
            AcqRequest::UnsubscribeFromScans => self.client.unsubscribe_from_scans().await?,
            AcqRequest::RequestRawFileNames => {
                let names = self.client.request_raw_file_name().await.unwrap_or_else(|e| {
                    warn!("raw file names unavailable: {e}");
                    Vec::new()
                });
                self.relay.received_raw_file_names(names);
            }
            AcqRequest::RequestLastAcquisitionFile => {
                let path = self
                    .client
                    .request_last_acquisition_file()
                    .await
                    .unwrap_or_else(|e| {
                        warn!("raw file download failed: {e}");
                        None
                    });
                self.relay.acquisition_file_download_finished(path);
            }
            AcqRequest::Log(record) => record.emit(),
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> AcquisitionRequestHandler for InstrumentRequestHandler<T> {
    async fn handle_request(&self, request: AcqRequest) {
        let id = request.id();
        if let Err(e) = self.execute(request).await {
            error!("{id} failed: {e}");
            self.relay.instrument_error(Some(e.to_string()));
        }
    }
}

/// What to run in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Server address. `None` connects to the local host.
    pub address: Option<String>,
    pub algorithm: String,
    pub config: Option<PathBuf>,
    pub sequence: Option<PathBuf>,
    /// Instrument id on the server.
    pub instrument: i64,
    pub model: InstrumentModel,
    /// Mock servers only: ask the server to shut down after the run.
    pub shut_down_server: bool,
}

impl RunRequest {
    #[must_use]
    pub fn new(address: Option<String>, algorithm: impl Into<String>) -> Self {
        Self {
            address,
            algorithm: algorithm.into(),
            config: None,
            sequence: None,
            instrument: 1,
            model: InstrumentModel::Tribrid,
            shut_down_server: false,
        }
    }
}

pub struct MsReactClient {
    config: ClientConfig,
    registry: Arc<AlgorithmRegistry>,
    executor: Arc<dyn AcquisitionExecutor>,
}

impl std::fmt::Debug for MsReactClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsReactClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MsReactClient {
    pub fn new(
        config: ClientConfig,
        registry: Arc<AlgorithmRegistry>,
        executor: Arc<dyn AcquisitionExecutor>,
    ) -> Self {
        Self {
            config,
            registry,
            executor,
        }
    }

    /// Run a session over a WebSocket connection. See [`Self::run_with`].
    ///
    /// # Errors
    /// See [`Self::run_with`].
    pub async fn run<S>(&self, request: &RunRequest, shutdown: S) -> Result<bool, ClientError>
    where
        S: Future<Output = ()> + Send,
    {
        let transport = WebSocketTransport::new(self.config.transport_config());
        self.run_with(transport, request, shutdown).await
    }

    /// Connect, select the instrument, run the algorithm and clean up. Returns
    /// whether the algorithm ran to completion.
    ///
    /// When `shutdown` completes first, the running acquisition is ended with
    /// an error and the session is cleaned up as usual.
    ///
    /// # Errors
    /// - [`ClientError::ConnectionFailed`] if the server refused the connection
    /// - [`ClientError::Instrument`] if the instrument could not be set up
    #[instrument(skip_all, fields(algorithm = %request.algorithm))]
    pub async fn run_with<T, S>(
        &self,
        transport: T,
        request: &RunRequest,
        shutdown: S,
    ) -> Result<bool, ClientError>
    where
        T: Transport + 'static,
        S: Future<Output = ()> + Send,
    {
        let queues = AcquisitionQueues::new();
        let relay = queues.relay();
        let client = Arc::new(
            InstrumentClient::new(transport, relay_events(relay.clone()))
                .with_response_timeout(self.config.response_timeout())
                .with_download_dir(self.config.download_dir.clone()),
        );

        let address = request.address.clone();
        info!("Instrument address: {}", address.as_deref().unwrap_or("localhost"));
        if !client.connect(address.clone()).await? {
            return Err(ClientError::ConnectionFailed {
                address: address.unwrap_or_else(|| "localhost".to_string()),
            });
        }
        info!("Successful connection to server");
        let listener = client.spawn_listener();

        let handler = Arc::new(InstrumentRequestHandler::new(
            Arc::clone(&client),
            relay,
            request.model,
        ));
        let mut manager = AlgorithmManager::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            handler,
            queues,
            ManagerSettings::from(&self.config),
        );
        let stop = manager.stop_handle();

        let session = async {
            let params = client.setup_instrument_connection(request.instrument).await?;
            debug!("instrument offers {} scan parameters", params.len());
            if !manager.select_algorithm(
                &request.algorithm,
                request.config.as_deref(),
                request.model.name(),
                request.sequence.as_deref(),
            ) {
                error!("Failed loading {}", request.algorithm);
                return Ok(false);
            }
            let completed = manager.run_algorithm().await;
            if request.shut_down_server {
                client.request_shut_down_server().await?;
            }
            Ok::<_, ClientError>(completed)
        };
        tokio::pin!(session);
        tokio::pin!(shutdown);

        let finished = tokio::select! {
            outcome = &mut session => Some(outcome),
            () = &mut shutdown => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                warn!("Interrupted, stopping the acquisition");
                stop.stop();
                session.await
            }
        };

        client.instrument_clean_up().await;
        let abort = listener.abort_handle();
        match tokio::time::timeout(LISTENER_STOP_TIMEOUT, listener).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("listener ended abnormally: {e}"),
            Err(_) => {
                // the transport is already disconnected at this point
                warn!("listener did not stop after clean up, aborting it");
                abort.abort();
            }
        }
        outcome
    }
}

#[cfg(test)]
mod unit {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use rmpv::Value;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::{relay_events, InstrumentRequestHandler};
    use crate::{
        acquisition::{settings::AcquisitionSettings, workflow::AcquisitionWorkflow},
        command::{AcqMessage, AcqRequest},
        instrument::{InstrumentClient, InstrumentEvent},
        instruments::InstrumentModel,
        manager::{AcquisitionQueues, AcquisitionRequestHandler},
        protocol::{
            codec,
            id::{CommandId, MessageId, ResponseId},
        },
        scan::Scan,
        transport::MockTransport,
    };

    /// A transport that records sent commands. Responses are injected through
    /// `dispatch` by the test.
    fn recording_transport(sent: Arc<Mutex<Vec<CommandId>>>) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_send().returning(move |frame| {
            if let Ok((MessageId::Command(c), _)) = codec::decode(&frame) {
                sent.lock().expect("not poisoned").push(c);
            }
            Ok(())
        });
        transport
    }

    /// Answer the first `expected` commands with `OK_RSP`.
    async fn acknowledge_all(
        client: &InstrumentClient<MockTransport>,
        sent: &Mutex<Vec<CommandId>>,
        expected: usize,
    ) {
        let mut answered = 0;
        while answered < expected {
            let count = sent.lock().expect("not poisoned").len();
            if count > answered {
                answered = count;
                client.dispatch(ResponseId::Ok.into(), None);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn listening_workflow_never_starts_the_acquisition() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(InstrumentClient::new(
            recording_transport(Arc::clone(&sent)),
            |_: InstrumentEvent| {},
        ));
        let queues = AcquisitionQueues::new();
        let handler = InstrumentRequestHandler::new(
            Arc::clone(&client),
            queues.relay(),
            InstrumentModel::Mock,
        );

        tokio::join!(
            handler.handle_request(AcqRequest::ReadyForAcquisitionStart(AcquisitionSettings::new(
                AcquisitionWorkflow::Listening
            ))),
            acknowledge_all(&client, &sent, 2)
        );
        assert_eq!(
            *sent.lock().expect("not poisoned"),
            [CommandId::SubscribeToScans, CommandId::ConfigAcq]
        );
    }

    #[tokio::test]
    async fn triggering_workflow_starts_the_acquisition() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(InstrumentClient::new(
            recording_transport(Arc::clone(&sent)),
            |_: InstrumentEvent| {},
        ));
        let queues = AcquisitionQueues::new();
        let handler = InstrumentRequestHandler::new(
            Arc::clone(&client),
            queues.relay(),
            InstrumentModel::Tribrid,
        );

        tokio::join!(
            handler.handle_request(AcqRequest::ReadyForAcquisitionStart(AcquisitionSettings::new(
                AcquisitionWorkflow::LimitedByCount(10)
            ))),
            acknowledge_all(&client, &sent, 3)
        );
        assert_eq!(
            *sent.lock().expect("not poisoned"),
            [CommandId::SubscribeToScans, CommandId::ConfigAcq, CommandId::StartAcq]
        );
        assert!(client.is_acquisition_running());
    }

    #[tokio::test]
    async fn unsupported_workflow_is_reported_to_the_acquisition() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(InstrumentClient::new(
            recording_transport(Arc::clone(&sent)),
            |_: InstrumentEvent| {},
        ));
        let queues = AcquisitionQueues::new();
        let handler = InstrumentRequestHandler::new(
            Arc::clone(&client),
            queues.relay(),
            InstrumentModel::Mock,
        );

        handler
            .handle_request(AcqRequest::ReadyForAcquisitionStart(AcquisitionSettings::new(
                AcquisitionWorkflow::Permanent,
            )))
            .await;

        assert!(sent.lock().expect("not poisoned").is_empty());
        assert!(matches!(
            queues.drain_inbound().as_slice(),
            [AcqMessage::Error(Some(message))] if message.contains("permanent")
        ));
    }

    /// Answer the first command with `response`.
    async fn answer(
        client: &InstrumentClient<MockTransport>,
        sent: &Mutex<Vec<CommandId>>,
        response: ResponseId,
        payload: Option<Value>,
    ) {
        while sent.lock().expect("not poisoned").is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        client.dispatch(response.into(), payload);
    }

    const NOT_FOUND: &[u8] =
        b"HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\nconnection: close\r\n\r\nnot found";

    /// An HTTP server answering one request with 404.
    async fn not_found_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let port = listener.local_addr().expect("should have an address").port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("client should connect");
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream
                .write_all(NOT_FOUND)
                .await;
        });
        format!("http://127.0.0.1:{port}/files/run.raw")
    }

    #[tokio::test]
    async fn failed_raw_file_download_does_not_end_the_acquisition() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let dir = tempfile::tempdir().expect("should create temp dir");
        let client = Arc::new(
            InstrumentClient::new(
                recording_transport(Arc::clone(&sent)),
                |_: InstrumentEvent| {},
            )
            .with_download_dir(dir.path().to_path_buf()),
        );
        let queues = AcquisitionQueues::new();
        let handler = InstrumentRequestHandler::new(
            Arc::clone(&client),
            queues.relay(),
            InstrumentModel::Mock,
        );
        let url = not_found_server().await;

        tokio::join!(
            handler.handle_request(AcqRequest::RequestLastAcquisitionFile),
            answer(&client, &sent, ResponseId::LastAcqFile, Some(Value::from(url)))
        );

        assert_eq!(
            queues.drain_inbound(),
            vec![AcqMessage::RawFileDownloadFinished(None)]
        );
    }

    #[tokio::test]
    async fn unavailable_raw_file_names_do_not_end_the_acquisition() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(InstrumentClient::new(
            recording_transport(Arc::clone(&sent)),
            |_: InstrumentEvent| {},
        ));
        let queues = AcquisitionQueues::new();
        let handler = InstrumentRequestHandler::new(
            Arc::clone(&client),
            queues.relay(),
            InstrumentModel::Mock,
        );

        tokio::join!(
            handler.handle_request(AcqRequest::RequestRawFileNames),
            answer(&client, &sent, ResponseId::Error, Some(Value::from("no acquisition yet")))
        );

        assert_eq!(
            queues.drain_inbound(),
            vec![AcqMessage::RawFileNames(Vec::new())]
        );
    }

    #[test]
    fn events_are_relayed_to_the_acquisition() {
        let queues = AcquisitionQueues::new();
        let forward = relay_events(queues.relay());

        forward(InstrumentEvent::Scan(Scan::new(Value::from(3))));
        forward(InstrumentEvent::FinishedAcquisition);
        forward(InstrumentEvent::Error(None));

        assert_eq!(
            queues.drain_inbound(),
            vec![
                AcqMessage::Scan(Scan::new(Value::from(3))),
                AcqMessage::AcquisitionEnded,
                AcqMessage::Error(None)
            ]
        );
    }
}
