//! Slice→instance coordinator.
//!
//! Glue with one-way dependencies: the coordinator watches the slice
//! store, owns the instance lifecycle (CAT listener, settings file, child
//! process), mirrors CAT mutations to the radio and exposes the operator
//! surface. Nothing here holds a back-reference; everything arrives on
//! channels.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{LinkError, Result};
use crate::flex::{RadioClient, RadioCommand};
use crate::ini::InstanceIni;
use crate::qso::{self, QsoConfig, QsoHandle, TxIntent};
use crate::slices::SliceStore;
use crate::supervisor::{InstanceExit, SpawnSpec, Supervisor};
use crate::telemetry::TelemetryHub;
use crate::types::{BusEvent, CatEvent, DecodeReport, Mode, Slice, SliceEvent, TelemetryEvent};
use crate::wsjtx::{Color, Command, Configure};

const CAT_EVENT_QUEUE: usize = 64;

struct ManagedInstance {
    slice_index: Option<usize>,
    cat_port: Option<u16>,
    listener: Option<crate::cat::CatListener>,
}

pub struct Coordinator {
    store: Arc<SliceStore>,
    radio: Option<RadioClient>,
    supervisor: Arc<Supervisor>,
    hub: TelemetryHub,
    bus: broadcast::Sender<BusEvent>,
    cat_tx: mpsc::Sender<CatEvent>,
    instances: DashMap<String, ManagedInstance>,
    qsos: DashMap<String, QsoHandle>,
    callsign: String,
    grid: String,
    wsjtx_path: PathBuf,
    settings_dir: PathBuf,
    cat_base_port: u16,
    telemetry_port: u16,
    default_bands: Vec<u64>,
    snr_weak: i32,
    snr_strong: i32,
}

impl Coordinator {
    /// Wire up the coordinator and spawn its worker tasks.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        cfg: &Config,
        settings_dir: PathBuf,
        store: Arc<SliceStore>,
        radio: Option<RadioClient>,
        supervisor: Arc<Supervisor>,
        exits: mpsc::Receiver<InstanceExit>,
        hub: TelemetryHub,
        bus: broadcast::Sender<BusEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (cat_tx, cat_rx) = mpsc::channel(CAT_EVENT_QUEUE);
        let coord = Arc::new(Self {
            store: store.clone(),
            radio,
            supervisor,
            hub,
            bus,
            cat_tx,
            instances: DashMap::new(),
            qsos: DashMap::new(),
            callsign: cfg.station.callsign.clone(),
            grid: cfg.station.grid.clone(),
            wsjtx_path: cfg.wsjtx.path.clone(),
            settings_dir,
            cat_base_port: cfg.flex.cat_base_port,
            telemetry_port: cfg.wsjtx.telemetry_port,
            default_bands: cfg.flex.default_bands.clone(),
            snr_weak: cfg.dashboard.snr_weak_threshold,
            snr_strong: cfg.dashboard.snr_strong_threshold,
        });

        tokio::spawn(slice_event_task(coord.clone(), store.subscribe(), shutdown.clone()));
        tokio::spawn(cat_event_task(coord.clone(), cat_rx, shutdown.clone()));
        tokio::spawn(exit_task(coord.clone(), exits, shutdown.clone()));
        tokio::spawn(telemetry_task(coord.clone(), shutdown));
        coord
    }

    pub fn subscribe_bus(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    fn publish(&self, ev: BusEvent) {
        let _ = self.bus.send(ev);
    }

    // ---- lifecycle ---------------------------------------------------

    /// Bring up the CAT listener, settings file and child for a slice.
    pub async fn launch_for_slice(&self, slice: &Slice) -> Result<String> {
        let index = slice.index;
        let instance_id = Slice::derived_instance_id(index);
        if self.instances.contains_key(&instance_id) {
            return Err(LinkError::InvariantViolation(format!(
                "instance {instance_id} already managed"
            )));
        }
        // base port 0 delegates the choice to the OS; the INI below
        // carries whatever the listener actually bound
        let requested_port = match self.cat_base_port {
            0 => 0,
            base => base + index as u16,
        };
        let listener = crate::cat::CatListener::spawn(
            index,
            requested_port,
            instance_id.clone(),
            self.store.clone(),
            self.cat_tx.clone(),
        )
        .await?;
        let cat_port = listener.port;

        let ini = InstanceIni::for_slice(
            &instance_id,
            cat_port,
            self.telemetry_port,
            slice.dax_channel,
            &self.callsign,
            &self.grid,
        );
        if let Err(e) = ini.write(&self.settings_dir) {
            warn!(instance_id, error = %e, "settings write failed, launching anyway");
        }

        if let Err(e) = self.supervisor.spawn(SpawnSpec {
            instance_id: instance_id.clone(),
            program: self.wsjtx_path.clone(),
            args: vec!["--rig-name".into(), instance_id.clone()],
        }) {
            listener.stop().await;
            return Err(e);
        }

        self.store.bind_instance(index, Some(instance_id.clone()));
        self.instances.insert(
            instance_id.clone(),
            ManagedInstance {
                slice_index: Some(index),
                cat_port: Some(cat_port),
                listener: Some(listener),
            },
        );
        self.publish(BusEvent::InstanceLaunched { instance_id: instance_id.clone() });
        info!(instance_id, slice = index, cat_port, "instance launched for slice");
        Ok(instance_id)
    }

    /// Launch a single instance against a fixed rig name (no SDR backend).
    pub fn launch_standard(&self, rig_name: &str) -> Result<String> {
        let instance_id = rig_name.to_string();
        if self.instances.contains_key(&instance_id) {
            return Err(LinkError::InvariantViolation(format!(
                "instance {instance_id} already managed"
            )));
        }
        self.supervisor.spawn(SpawnSpec {
            instance_id: instance_id.clone(),
            program: self.wsjtx_path.clone(),
            args: vec!["--rig-name".into(), instance_id.clone()],
        })?;
        self.instances.insert(
            instance_id.clone(),
            ManagedInstance { slice_index: None, cat_port: None, listener: None },
        );
        self.publish(BusEvent::InstanceLaunched { instance_id: instance_id.clone() });
        info!(instance_id, "standard instance launched");
        Ok(instance_id)
    }

    /// Tear down listener, child and mappings for one instance.
    async fn teardown(&self, instance_id: &str) {
        if let Some((_, managed)) = self.instances.remove(instance_id) {
            if let Some(listener) = managed.listener {
                listener.stop().await;
            }
            if let Some(index) = managed.slice_index {
                self.store.bind_instance(index, None);
            }
        }
        if let Some((_, qso)) = self.qsos.remove(instance_id) {
            qso.abort();
        }
        self.supervisor.stop(instance_id);
        self.hub.forget_peer(instance_id);
    }

    // ---- operator surface --------------------------------------------

    fn require_known(&self, instance_id: &str) -> Result<()> {
        if self.instances.contains_key(instance_id) {
            Ok(())
        } else {
            Err(LinkError::UnknownInstance(instance_id.to_string()))
        }
    }

    /// Manually launch the instance for an allocated slice index.
    pub async fn start_instance(&self, index: usize) -> Result<String> {
        let slice = self
            .store
            .snapshot(index)
            .filter(|s| s.in_use)
            .ok_or_else(|| LinkError::UnknownInstance(format!("slice {index}")))?;
        if let Some(id) = &slice.instance_id {
            return Err(LinkError::InvariantViolation(format!(
                "slice {index} already bound to {id}"
            )));
        }
        self.launch_for_slice(&slice).await
    }

    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.require_known(instance_id)?;
        self.teardown(instance_id).await;
        Ok(())
    }

    /// Start the autonomous exchange with `target_call` on one instance.
    pub fn execute_qso(&self, instance_id: &str, target_call: &str) -> Result<()> {
        self.require_known(instance_id)?;
        if let Some(existing) = self.qsos.get(instance_id) {
            if !existing.is_terminal() {
                return Err(LinkError::QsoBusy(instance_id.to_string()));
            }
        }
        let cfg = QsoConfig::new(&self.callsign, target_call, &self.grid);
        let (intent_tx, intent_rx) = mpsc::channel(4);
        let handle = qso::start(
            instance_id.to_string(),
            cfg,
            self.hub.subscribe(),
            intent_tx,
            self.bus.clone(),
        );
        tokio::spawn(qso_prologue(
            self.hub.clone(),
            instance_id.to_string(),
            target_call.to_string(),
            self.grid.clone(),
        ));
        tokio::spawn(intent_task(self.hub.clone(), instance_id.to_string(), intent_rx));
        self.qsos.insert(instance_id.to_string(), handle);
        Ok(())
    }

    pub async fn halt_tx(&self, instance_id: &str, auto_only: bool) -> Result<()> {
        self.require_known(instance_id)?;
        self.hub.send_command(instance_id, &Command::HaltTx { auto_only }).await
    }

    /// Frequency change by instance: slice-bound instances retune through
    /// the store and radio, standard instances get a rig-control frame.
    pub async fn set_frequency(&self, instance_id: &str, hz: u64) -> Result<()> {
        self.require_known(instance_id)?;
        match self.slice_of(instance_id) {
            Some(index) => {
                self.store.set_frequency(index, hz)?;
                self.forward_radio(RadioCommand::Tune { index, hz });
                Ok(())
            }
            None => {
                let cmd = Command::RigControl { freq_hz: hz as i64, mode: String::new() };
                self.hub.send_command(instance_id, &cmd).await
            }
        }
    }

    pub async fn set_mode(&self, instance_id: &str, mode: Mode) -> Result<()> {
        self.require_known(instance_id)?;
        match self.slice_of(instance_id) {
            Some(index) => {
                self.store.set_mode(index, mode.clone())?;
                self.forward_radio(RadioCommand::SetMode { index, mode });
                Ok(())
            }
            None => {
                let cmd = Command::RigControl { freq_hz: 0, mode: mode.as_backend().to_string() };
                self.hub.send_command(instance_id, &cmd).await
            }
        }
    }

    /// One-shot reply to a station the operator picked from the decodes.
    pub async fn reply_to_station(&self, instance_id: &str, decode: &DecodeReport) -> Result<()> {
        self.require_known(instance_id)?;
        let cmd = Command::Reply {
            time_ms: decode.time_ms,
            snr_db: decode.snr_db,
            dt_seconds: decode.dt_seconds,
            df_hz: decode.df_hz,
            mode: decode.mode.clone(),
            message: decode.raw_text.clone(),
            low_confidence: false,
            modifiers: 0x02,
        };
        self.hub.send_command(instance_id, &cmd).await
    }

    /// Best-effort, idempotent: drop transmit everywhere, halt every app.
    pub async fn emergency_stop(&self) -> Result<()> {
        for id in self.supervisor.running_ids() {
            if let Err(e) = self.hub.send_command(&id, &Command::HaltTx { auto_only: false }).await
            {
                warn!(instance_id = %id, error = %e, "halt-tx not delivered");
            }
        }
        let cleared = self.store.clear_all_tx();
        for index in &cleared {
            self.forward_radio(RadioCommand::Xmit(false));
            info!(slice = index, "transmit force-cleared");
        }
        Ok(())
    }

    pub fn list_instances(&self) -> Vec<InstanceInfo> {
        self.instances
            .iter()
            .map(|e| InstanceInfo {
                instance_id: e.key().clone(),
                slice_index: e.value().slice_index,
                cat_port: e.value().cat_port,
                pid: self.supervisor.pid(e.key()),
                running: self.supervisor.is_running(e.key()),
                qso_state: self.qsos.get(e.key()).map(|q| format!("{:?}", q.state())),
            })
            .collect()
    }

    /// Allocated slices, for the operator surface.
    pub fn list_slices(&self) -> Vec<Slice> {
        self.store.active()
    }

    /// Configured band plan (dial frequencies in Hz).
    pub fn band_plan(&self) -> &[u64] {
        &self.default_bands
    }

    fn slice_of(&self, instance_id: &str) -> Option<usize> {
        self.store.index_of_instance(instance_id)
    }

    fn forward_radio(&self, cmd: RadioCommand) {
        if let Some(radio) = &self.radio {
            // rejection is already logged as a soft error
            let _ = radio.send(cmd);
        }
    }
}

/// Summary row for the operator surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub slice_index: Option<usize>,
    pub cat_port: Option<u16>,
    pub pid: Option<u32>,
    pub running: bool,
    pub qso_state: Option<String>,
}

// ---- worker tasks ----------------------------------------------------

async fn slice_event_task(
    coord: Arc<Coordinator>,
    mut events: broadcast::Receiver<SliceEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(SliceEvent::Added(slice)) => {
                    if let Err(e) = coord.launch_for_slice(&slice).await {
                        warn!(slice = slice.index, error = %e, "slice launch failed");
                    }
                }
                Ok(SliceEvent::Removed(slice)) => {
                    if let Some(id) = &slice.instance_id {
                        info!(slice = slice.index, instance_id = %id, "slice released");
                        coord.teardown(id).await;
                    }
                }
                Ok(SliceEvent::Updated(slice)) => {
                    // CAT listeners poll the store, so the cache refresh is
                    // implicit; dashboards still want the push
                    coord.publish(BusEvent::SliceUpdated { slice });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "slice event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn cat_event_task(
    coord: Arc<Coordinator>,
    mut events: mpsc::Receiver<CatEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(CatEvent::FrequencyChange { index, hz }) => {
                    coord.forward_radio(RadioCommand::Tune { index, hz });
                }
                Some(CatEvent::ModeChange { index, mode }) => {
                    coord.forward_radio(RadioCommand::SetMode { index, mode });
                }
                Some(CatEvent::PttChange { index: _, on }) => {
                    coord.forward_radio(RadioCommand::Xmit(on));
                }
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn exit_task(
    coord: Arc<Coordinator>,
    mut exits: mpsc::Receiver<InstanceExit>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            exit = exits.recv() => match exit {
                Some(exit) => {
                    if !exit.requested {
                        let err = LinkError::ChildExited(exit.instance_id.clone());
                        warn!(error = %err, code = ?exit.code, "unexpected child exit");
                    }
                    coord.teardown(&exit.instance_id).await;
                    coord.publish(BusEvent::InstanceStopped {
                        instance_id: exit.instance_id,
                    });
                }
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// Mirror decode/status telemetry onto the dashboard bus.
async fn telemetry_task(coord: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let mut events = coord.hub.subscribe();
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(TelemetryEvent::Decode(d)) => {
                    let strength = if d.snr_db <= coord.snr_weak {
                        "weak"
                    } else if d.snr_db >= coord.snr_strong {
                        "strong"
                    } else {
                        "normal"
                    };
                    tracing::debug!(instance_id = %d.instance_id, snr = d.snr_db,
                        strength, text = %d.raw_text, "decode");
                    coord.publish(BusEvent::Decode(d));
                }
                Ok(TelemetryEvent::Status(s)) => coord.publish(BusEvent::Status(s)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "telemetry bus lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// Seed a freshly started QSO: point the app at the target, highlight it,
/// announce our grid, clear the stale rx-frequency window.
async fn qso_prologue(hub: TelemetryHub, instance_id: String, target_call: String, grid: String) {
    let steps = [
        Command::Configure(Configure {
            dx_call: target_call.clone(),
            generate_messages: true,
            ..Default::default()
        }),
        Command::HighlightCallsign {
            call: target_call,
            background: Color::rgb(0xFFFF, 0x4444, 0),
            foreground: Color::rgb(0, 0, 0),
            highlight_last: true,
        },
        Command::Location { grid },
        Command::Clear { window: 1 },
    ];
    for cmd in steps {
        if let Command::Location { grid } = &cmd {
            if grid.is_empty() {
                continue;
            }
        }
        if let Err(e) = hub.send_command(&instance_id, &cmd).await {
            // the instance may not have spoken yet; the QSO itself still runs
            tracing::debug!(instance_id, error = %e, "qso prologue frame skipped");
        }
    }
}

/// Realize one QSO's transmit intents as outbound command frames.
async fn intent_task(hub: TelemetryHub, instance_id: String, mut intents: mpsc::Receiver<TxIntent>) {
    while let Some(intent) = intents.recv().await {
        let cmd = match intent {
            TxIntent::Reply { decode } => Command::Reply {
                time_ms: decode.time_ms,
                snr_db: decode.snr_db,
                dt_seconds: decode.dt_seconds,
                df_hz: decode.df_hz,
                mode: decode.mode,
                message: decode.raw_text,
                low_confidence: false,
                modifiers: 0x02,
            },
            TxIntent::Text { message } => Command::FreeText { text: message, send: true },
        };
        if let Err(e) = hub.send_command(&instance_id, &cmd).await {
            warn!(instance_id, error = %e, "transmit intent not delivered");
        }
    }
}
