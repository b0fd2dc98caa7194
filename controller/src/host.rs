use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{mpsc, Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, ClientError, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};
use tracing::{debug, error, info, warn};

use climate_common::{
    error::{PublishError, StorageError},
    storage::{self, ConfigStore},
    ActuatorHandle, ClimateEngine, CommandHandler, CommandReport, ConfigUpdate, Configuration,
    ControlLoop, CoreError, DisplayFeed, DisplaySnapshot, FanSpeed, LivenessMonitor,
    NetworkConfig, PowerMeter, Publisher, RuntimeConfig, SharedState, StatusPayload,
    SystemState, TelemetryPayload, TemperatureAcquisition, AVAILABILITY_OFFLINE,
    AVAILABILITY_ONLINE, MAX_COMMAND_BYTES, TOPIC_AVAILABILITY, TOPIC_COMMAND,
};

use crate::sim::{HostDelay, SimulatedPlant};

const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const METER_PAUSE: Duration = Duration::from_millis(20);
const DISPLAY_PERIOD: Duration = Duration::from_secs(1);
const SUPERVISOR_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct AppState {
    shared: SharedState,
    commands: mpsc::Sender<CommandRequest>,
    lock_timeout: Duration,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    config_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Persisted configuration record as a small binary file.
struct FileStore {
    path: PathBuf,
}

struct MqttPublisher {
    client: AsyncClient,
}

enum Inbound {
    Payload(Vec<u8>),
    Update(ConfigUpdate),
}

/// Work for the command unit. HTTP callers wait on `reply`; MQTT does not.
struct CommandRequest {
    inbound: Inbound,
    reply: Option<oneshot::Sender<Result<CommandReport, CoreError>>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    status: StatusPayload,
    telemetry: TelemetryPayload,
    snapshot: DisplaySnapshot,
    lines: [String; 2],
}

#[derive(Debug, Serialize)]
struct CommandView {
    config: Configuration,
    compressor: bool,
    fan: FanSpeed,
    persisted: bool,
    published: bool,
}

impl From<CommandReport> for CommandView {
    fn from(report: CommandReport) -> Self {
        Self {
            config: report.cfg,
            compressor: report.actuators.compressor,
            fan: report.actuators.fan,
            persisted: report.persisted,
            published: report.published,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.network);
    runtime.sanitize();

    let mut config_store = FileStore {
        path: store.config_path.as_ref().clone(),
    };
    let cfg = storage::load_or_default(&mut config_store);
    info!(
        "configuration loaded: on={} mode={} fan={} sp={:.1}",
        cfg.system_on,
        cfg.mode.as_str(),
        cfg.fan_speed.level(),
        cfg.setpoint
    );

    let lock_timeout = Duration::from_millis(runtime.control.lock_timeout_ms);
    let shared = SharedState::new(SystemState::new(cfg));
    let engine = ClimateEngine::new(runtime.control.clone());
    let plant = SimulatedPlant::new(runtime.sensors);
    let actuators = ActuatorHandle::new(plant.clone());
    let liveness = LivenessMonitor::new(runtime.control.liveness_timeout_ms, monotonic_ms());

    let mut mqtt_options = MqttOptions::new(
        runtime.network.client_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(MQTT_KEEP_ALIVE);
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_AVAILABILITY,
        AVAILABILITY_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher {
        client: mqtt.clone(),
    });

    let (commands, requests) = mpsc::channel();
    spawn_command_loop(
        CommandHandler::new(
            shared.clone(),
            engine.clone(),
            Box::new(config_store),
            actuators.clone(),
            publisher.clone(),
        ),
        requests,
    );
    spawn_control_loop(
        ControlLoop::new(
            TemperatureAcquisition::new(plant.clone(), HostDelay, runtime.sensors),
            engine,
            shared.clone(),
            actuators,
        )
        .with_publisher(publisher),
        liveness.clone(),
    );
    spawn_meter_loop(
        PowerMeter::new(runtime.meter.clone()),
        plant,
        shared.clone(),
        lock_timeout,
    );
    spawn_display_loop(DisplayFeed::new(shared.clone(), lock_timeout));
    spawn_mqtt_loop(mqtt, eventloop, commands.clone());
    spawn_liveness_supervisor(liveness);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/command", post(handle_post_command))
        .route("/api/button", post(handle_post_button))
        .with_state(AppState {
            shared,
            commands,
            lock_timeout,
        });

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

fn announce(mqtt: &AsyncClient) -> Result<(), ClientError> {
    mqtt.try_publish(
        TOPIC_AVAILABILITY,
        QoS::AtLeastOnce,
        true,
        AVAILABILITY_ONLINE,
    )?;
    mqtt.try_subscribe(TOPIC_COMMAND, QoS::AtLeastOnce)
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    commands: mpsc::Sender<CommandRequest>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.topic != TOPIC_COMMAND {
                        continue;
                    }
                    if message.payload.len() > MAX_COMMAND_BYTES {
                        warn!(
                            "dropping oversized command on {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    let request = CommandRequest {
                        inbound: Inbound::Payload(message.payload.to_vec()),
                        reply: None,
                    };
                    if commands.send(request).is_err() {
                        error!("command unit stopped; dropping mqtt command");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(err) = announce(&mqtt) {
                        warn!("mqtt announce failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_command_loop(mut handler: CommandHandler, requests: mpsc::Receiver<CommandRequest>) {
    thread::Builder::new()
        .name("command".into())
        .spawn(move || {
            for request in requests {
                let now_ms = monotonic_ms();
                let result = match request.inbound {
                    Inbound::Payload(payload) => handler.handle(&payload, now_ms),
                    Inbound::Update(update) => handler.execute(update, now_ms),
                };
                if let Some(reply) = request.reply {
                    let _ = reply.send(result);
                }
            }
        })
        .expect("failed to spawn command thread");
}

fn spawn_control_loop(
    mut control: ControlLoop<SimulatedPlant, HostDelay>,
    liveness: LivenessMonitor,
) {
    thread::Builder::new()
        .name("control".into())
        .spawn(move || loop {
            let started = Instant::now();
            match control.run_cycle(monotonic_ms) {
                Ok(report) => debug!(
                    compressor = report.command.compressor,
                    fan = report.command.fan.level(),
                    published = report.published,
                    "control cycle"
                ),
                Err(err) => debug!("control cycle skipped: {err}"),
            }
            liveness.beat(monotonic_ms());
            thread::sleep(control.period().saturating_sub(started.elapsed()));
        })
        .expect("failed to spawn control thread");
}

fn spawn_meter_loop(
    meter: PowerMeter,
    mut sampler: SimulatedPlant,
    shared: SharedState,
    lock_timeout: Duration,
) {
    thread::Builder::new()
        .name("meter".into())
        .spawn(move || loop {
            match meter.measure(&mut sampler, monotonic_us) {
                Ok(reading) => {
                    if let Err(err) =
                        shared.with(lock_timeout, "meter", |state| state.update_power(&reading))
                    {
                        warn!("dropping power reading: {err}");
                    }
                }
                Err(err) => warn!("power measurement failed: {err}"),
            }
            thread::sleep(METER_PAUSE);
        })
        .expect("failed to spawn meter thread");
}

fn spawn_display_loop(mut feed: DisplayFeed) {
    thread::Builder::new()
        .name("display".into())
        .spawn(move || {
            let mut shown: Option<[String; 2]> = None;
            loop {
                if let Some(snapshot) = feed.refresh() {
                    let lines = snapshot.lines();
                    if shown.as_ref() != Some(&lines) {
                        debug!("display |{}|{}|", lines[0], lines[1]);
                        shown = Some(lines);
                    }
                }
                thread::sleep(DISPLAY_PERIOD);
            }
        })
        .expect("failed to spawn display thread");
}

fn spawn_liveness_supervisor(liveness: LivenessMonitor) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SUPERVISOR_PERIOD);
        loop {
            interval.tick().await;
            if let Err(err) = liveness.check(monotonic_ms()) {
                error!("{err}; terminating so the supervisor restarts the controller");
                std::process::exit(1);
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let shared = state.shared.clone();
    let lock_timeout = state.lock_timeout;
    let read = tokio::task::spawn_blocking(move || {
        shared.with(lock_timeout, "http", |system| {
            (
                system.status(),
                system.telemetry(),
                system.display_snapshot(),
            )
        })
    })
    .await;

    match read {
        Ok(Ok((status, telemetry, snapshot))) => Json(StatusView {
            status,
            telemetry,
            lines: snapshot.lines(),
            snapshot,
        })
        .into_response(),
        Ok(Err(err)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn handle_post_command(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    submit(&state, Inbound::Payload(body.to_vec())).await
}

async fn handle_post_button(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, Inbound::Update(ConfigUpdate::TogglePower)).await
}

async fn submit(state: &AppState, inbound: Inbound) -> axum::response::Response {
    let (reply, response) = oneshot::channel();
    let request = CommandRequest {
        inbound,
        reply: Some(reply),
    };
    if state.commands.send(request).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "command unit is not running");
    }

    match response.await {
        Ok(Ok(report)) => Json(CommandView::from(report)).into_response(),
        Ok(Err(CoreError::Protocol(err))) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Ok(Err(err)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "command unit dropped the request",
        ),
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLIMATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.climate"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            config_path: Arc::new(data_dir.join("config.bin")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// A missing file is seeded with defaults so the tuning is visible on disk.
    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let raw = {
            let _guard = self.lock.lock().await;
            match tokio::fs::read(self.runtime_path.as_ref()).await {
                Ok(raw) => Some(raw),
                Err(err) if err.kind() == ErrorKind::NotFound => None,
                Err(err) => return Err(err.into()),
            }
        };

        match raw {
            Some(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            None => {
                let runtime = RuntimeConfig::default();
                self.save_runtime_config(&runtime).await?;
                Ok(runtime)
            }
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

impl ConfigStore for FileStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Unavailable(err.to_string())),
        }
    }

    fn save(&mut self, record: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        }
        std::fs::write(&self.path, record).map_err(|err| StorageError::Unavailable(err.to_string()))
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .map_err(|err| PublishError::Transport(err.to_string()))
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn boot_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn monotonic_ms() -> u64 {
    boot_instant()
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn monotonic_us() -> u64 {
    boot_instant()
        .elapsed()
        .as_micros()
        .try_into()
        .unwrap_or(u64::MAX)
}
