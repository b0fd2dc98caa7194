use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use embedded_hal::delay::DelayNs;
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{Ets, FreeRtos},
    gpio::{
        AnyOutputPin, Gpio32, Gpio34, Gpio35, Input, Output, OutputPin, PinDriver, Pull,
    },
    modem::Modem,
    prelude::Peripherals,
    task::thread::ThreadSpawnConfiguration,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};

use climate_common::{
    error::{MeterError, PublishError, StorageError},
    panel::BUTTON_POLL_MS,
    storage::{self, ConfigStore, CONFIG_KEY, CONFIG_NAMESPACE},
    ActuatorHandle, ActuatorInterlock, AnalogSampler, ClimateEngine, CommandHandler,
    ConfigUpdate, ControlLoop, Debouncer, DisplayFeed, NetworkConfig, OneWireBus, PowerMeter,
    Publisher, RelayPins, RuntimeConfig, SharedState, StatusLeds, SystemState,
    TemperatureAcquisition, TemperatureBus, AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE,
    MAX_COMMAND_BYTES, TOPIC_AVAILABILITY, TOPIC_COMMAND,
};

const NVS_RUNTIME_NAMESPACE: &str = "climate";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const CONTROL_PRIORITY: u8 = 10;
const UNIT_STACK: usize = 12 * 1024;
const METER_PAUSE: Duration = Duration::from_millis(20);
const DISPLAY_PERIOD: Duration = Duration::from_secs(1);

type RelayDriver = PinDriver<'static, AnyOutputPin, Output>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// Persisted configuration record in its own NVS namespace.
struct NvsConfigStore {
    nvs: EspNvs<NvsDefault>,
}

struct EspPublisher {
    client: Arc<Mutex<EspMqttClient<'static>>>,
}

/// Pairs of raw ADC readings produced by a closure over the channel drivers.
struct AdcSampler<F>(F);

enum Inbound {
    Payload(Vec<u8>),
    Update(ConfigUpdate),
}

struct PanelPins {
    button: PinDriver<'static, Gpio32, Input>,
    leds: StatusLeds<RelayDriver>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    info!(
        "NVS runtime loaded: ssid=`{}`, mqtt=`{}:{}`",
        runtime.network.wifi_ssid, runtime.network.mqtt_host, runtime.network.mqtt_port,
    );

    let mut config_store = NvsConfigStore::open(nvs_partition.clone())?;
    let cfg = storage::load_or_default(&mut config_store);
    info!(
        "configuration loaded: on={} mode={} fan={} sp={:.1}",
        cfg.system_on,
        cfg.mode.as_str(),
        cfg.fan_speed.level(),
        cfg.setpoint
    );

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let relays = RelayPins {
        compressor: PinDriver::output(pins.gpio25.downgrade_output())?,
        fan_low: PinDriver::output(pins.gpio26.downgrade_output())?,
        fan_medium: PinDriver::output(pins.gpio27.downgrade_output())?,
        fan_high: PinDriver::output(pins.gpio14.downgrade_output())?,
    };
    let interlock = ActuatorInterlock::new(relays, FreeRtos, runtime.relays)
        .map_err(|err| anyhow!("failed to release relays at boot: {err}"))?;
    let actuators = ActuatorHandle::new(interlock);
    info!("relays released");

    let mut one_wire_pin = PinDriver::input_output_od(pins.gpio4)?;
    one_wire_pin.set_pull(Pull::Up)?;
    one_wire_pin.set_high()?;
    let bus = OneWireBus::new(one_wire_pin, Ets);

    let mut button = PinDriver::input(pins.gpio32)?;
    button.set_pull(Pull::Up)?;
    let panel = PanelPins {
        button,
        leds: StatusLeds::new(
            PinDriver::output(pins.gpio23.downgrade_output())?,
            PinDriver::output(pins.gpio33.downgrade_output())?,
            runtime.relays.polarity,
        ),
    };

    let wifi = match connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("wifi unavailable, controlling offline: {err:#}");
            None
        }
    };

    let lock_timeout = Duration::from_millis(runtime.control.lock_timeout_ms);
    let shared = SharedState::new(SystemState::new(cfg));
    let engine = ClimateEngine::new(runtime.control.clone());

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    let publisher: Arc<dyn Publisher> = Arc::new(EspPublisher {
        client: mqtt_client.clone(),
    });

    init_watchdog(watchdog_timeout_sec(runtime.control.liveness_timeout_ms))?;

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
    spawn_mqtt_receiver(mqtt_conn, mqtt_client, commands.clone());
    spawn_control_loop(
        ControlLoop::new(
            TemperatureAcquisition::new(bus, FreeRtos, runtime.sensors),
            engine,
            shared.clone(),
            actuators,
        )
        .with_publisher(publisher),
    )?;
    spawn_meter_loop(
        PowerMeter::new(runtime.meter.clone()),
        peripherals.adc1,
        pins.gpio34,
        pins.gpio35,
        shared.clone(),
        lock_timeout,
    );
    spawn_display_loop(DisplayFeed::new(shared.clone(), lock_timeout));
    spawn_panel_loop(panel, shared, lock_timeout, commands);

    // Keep the station alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        )),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        lwt: Some(LwtConfiguration {
            topic: TOPIC_AVAILABILITY,
            payload: AVAILABILITY_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    EspMqttClient::new(url.as_str(), &conf).context("failed to create mqtt client")
}

fn announce(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    mqtt.enqueue(
        TOPIC_AVAILABILITY,
        QoS::AtLeastOnce,
        true,
        AVAILABILITY_ONLINE.as_bytes(),
    )?;
    mqtt.subscribe(TOPIC_COMMAND, QoS::AtLeastOnce)?;
    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    commands: mpsc::Sender<Inbound>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(UNIT_STACK)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        if let Err(err) = announce(&mqtt) {
                            warn!("mqtt announce failed: {err:#}");
                        }
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Fragmented payloads are never valid commands.
                        if !matches!(details, Details::Complete) || topic != TOPIC_COMMAND {
                            continue;
                        }
                        if data.len() > MAX_COMMAND_BYTES {
                            warn!("dropping oversized command ({} bytes)", data.len());
                            continue;
                        }
                        if commands.send(Inbound::Payload(data.to_vec())).is_err() {
                            error!("command unit stopped; dropping mqtt command");
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn spawn_command_loop(mut handler: CommandHandler, requests: mpsc::Receiver<Inbound>) {
    thread::Builder::new()
        .name("command".into())
        .stack_size(UNIT_STACK)
        .spawn(move || {
            for inbound in requests {
                let now_ms = monotonic_ms();
                let result = match inbound {
                    Inbound::Payload(payload) => handler.handle(&payload, now_ms),
                    Inbound::Update(update) => handler.execute(update, now_ms),
                };
                if let Ok(report) = result {
                    debug!(
                        "command applied: compressor={} fan={} persisted={}",
                        report.actuators.compressor,
                        report.actuators.fan.level(),
                        report.persisted
                    );
                }
            }
        })
        .expect("failed to spawn command thread");
}

fn spawn_control_loop<B, W>(mut control: ControlLoop<B, W>) -> anyhow::Result<()>
where
    B: TemperatureBus + Send + 'static,
    W: DelayNs + Send + 'static,
{
    ThreadSpawnConfiguration {
        name: Some(&b"control\0"[..]),
        stack_size: UNIT_STACK,
        priority: CONTROL_PRIORITY,
        ..Default::default()
    }
    .set()?;

    thread::Builder::new()
        .name("control".into())
        .stack_size(UNIT_STACK)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            loop {
                let started = Instant::now();
                feed_watchdog();
                if let Err(err) = control.run_cycle(monotonic_ms) {
                    debug!("control cycle skipped: {err}");
                }
                feed_watchdog();
                thread::sleep(control.period().saturating_sub(started.elapsed()));
            }
        })
        .expect("failed to spawn control thread");

    ThreadSpawnConfiguration::default().set()?;
    Ok(())
}

fn spawn_meter_loop(
    meter: PowerMeter,
    adc1: ADC1,
    voltage_pin: Gpio34,
    current_pin: Gpio35,
    shared: SharedState,
    lock_timeout: Duration,
) {
    thread::Builder::new()
        .name("meter".into())
        .stack_size(UNIT_STACK)
        .spawn(move || {
            let adc = match AdcDriver::new(adc1) {
                Ok(adc) => adc,
                Err(err) => {
                    error!("adc init failed, power metering disabled: {err}");
                    return;
                }
            };
            let config = AdcChannelConfig {
                attenuation: DB_11,
                ..Default::default()
            };
            let channels = AdcChannelDriver::new(&adc, voltage_pin, &config).and_then(|voltage| {
                Ok((voltage, AdcChannelDriver::new(&adc, current_pin, &config)?))
            });
            let (mut voltage, mut current) = match channels {
                Ok(channels) => channels,
                Err(err) => {
                    error!("adc channel init failed, power metering disabled: {err}");
                    return;
                }
            };

            let mut sampler = AdcSampler(|| {
                let v = adc.read_raw(&mut voltage).map_err(|_| MeterError::Adc)?;
                let i = adc.read_raw(&mut current).map_err(|_| MeterError::Adc)?;
                Ok((f32::from(v), f32::from(i)))
            });

            loop {
                match meter.measure(&mut sampler, monotonic_us) {
                    Ok(reading) => {
                        if let Err(err) = shared
                            .with(lock_timeout, "meter", |state| state.update_power(&reading))
                        {
                            warn!("dropping power reading: {err}");
                        }
                    }
                    Err(err) => warn!("power measurement failed: {err}"),
                }
                thread::sleep(METER_PAUSE);
            }
        })
        .expect("failed to spawn meter thread");
}

fn spawn_display_loop(mut feed: DisplayFeed) {
    thread::Builder::new()
        .name("display".into())
        .stack_size(UNIT_STACK)
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

fn spawn_panel_loop(
    mut panel: PanelPins,
    shared: SharedState,
    lock_timeout: Duration,
    commands: mpsc::Sender<Inbound>,
) {
    thread::Builder::new()
        .name("panel".into())
        .stack_size(UNIT_STACK)
        .spawn(move || {
            let mut button = Debouncer::default();
            loop {
                // Active-low with the internal pull-up.
                if button.pressed_edge(panel.button.is_low()) {
                    info!("power button pressed");
                    if commands.send(Inbound::Update(ConfigUpdate::TogglePower)).is_err() {
                        error!("command unit stopped; ignoring power button");
                    }
                }

                if let Ok(system_on) = shared.with(lock_timeout, "panel", |state| state.cfg.system_on)
                {
                    if let Err(err) = panel.leds.show(system_on) {
                        warn!("status LED write failed: {err}");
                    }
                }
                thread::sleep(Duration::from_millis(BUTTON_POLL_MS));
            }
        })
        .expect("failed to spawn panel thread");
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_RUNTIME_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl NvsConfigStore {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{CONFIG_NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

impl ConfigStore for NvsConfigStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut buffer = [0_u8; storage::RECORD_LEN * 2];
        self.nvs
            .get_blob(CONFIG_KEY, &mut buffer)
            .map(|record| record.map(<[u8]>::to_vec))
            .map_err(|err| StorageError::Unavailable(err.to_string()))
    }

    fn save(&mut self, record: &[u8]) -> Result<(), StorageError> {
        self.nvs
            .set_blob(CONFIG_KEY, record)
            .map_err(|err| StorageError::Unavailable(err.to_string()))
    }
}

impl Publisher for EspPublisher {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError> {
        let mut client = self
            .client
            .lock()
            .map_err(|_| PublishError::Transport("mqtt client lock poisoned".into()))?;
        client
            .enqueue(topic, QoS::AtMostOnce, retain, payload)
            .map(|_| ())
            .map_err(|err| PublishError::Transport(err.to_string()))
    }
}

impl<F> AnalogSampler for AdcSampler<F>
where
    F: FnMut() -> Result<(f32, f32), MeterError>,
{
    fn sample(&mut self) -> Result<(f32, f32), MeterError> {
        (self.0)()
    }
}

fn watchdog_timeout_sec(liveness_timeout_ms: u64) -> u32 {
    (liveness_timeout_ms / 1000).clamp(1, u64::from(u32::MAX)) as u32
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_sys::ESP_OK {
        return Ok(());
    }
    // Already running from the bootloader config: apply our timeout instead.
    if rc == esp_idf_sys::ESP_ERR_INVALID_STATE {
        let rc = unsafe { esp_idf_sys::esp_task_wdt_reconfigure(&config) };
        if rc == esp_idf_sys::ESP_OK {
            return Ok(());
        }
        return Err(anyhow!("esp_task_wdt_reconfigure failed with code {}", rc));
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_sys::ESP_OK || rc == esp_idf_sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_sys::esp_task_wdt_reset() };
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
