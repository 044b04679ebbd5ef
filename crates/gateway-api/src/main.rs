//! Zigbee gateway - control core API server

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::routing::{get, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alarm_system::event_handler::{handle_alarm_system_device_event, handle_alarm_system_event};
use alarm_system::{init_default_alarm_system, load_alarm_systems, AlarmSystems, DeviceTable};
use gateway_core::{steady_now, Event, GatewayCore, SteadyTime};

mod alarmsystems;
mod driver;
mod persistence;
mod websocket;

use driver::DisconnectedController;
use persistence::FileStore;

/// The composed single-threaded gateway state behind one lock.
pub struct Gateway {
    pub core: GatewayCore<DisconnectedController>,
    pub alarms: AlarmSystems,
    pub dev_table: DeviceTable,
    /// Per device trigger item selection (`state/presence`, ...).
    pub triggers: HashMap<String, String>,
    pub store: Arc<FileStore>,
}

impl Gateway {
    fn new(store: Arc<FileStore>) -> Self {
        Self {
            core: GatewayCore::new(DisconnectedController::default()),
            alarms: AlarmSystems::new(),
            dev_table: DeviceTable::new(),
            triggers: HashMap::new(),
            store,
        }
    }

    /// Routes an APS indication into the core; IAS ACE commands also reach
    /// the alarm adapter inside the same default-response scope.
    pub fn handle_indication(&mut self, ind: &zigbee_aps::ApsDataIndication) {
        let alarms = &mut self.alarms;
        let dev_table = &self.dev_table;
        let store = Arc::clone(&self.store);

        self.core.handle_indication_ext(ind, |wrapper, resources, bus, ind, frame| {
            if ind.cluster_id == zigbee_aps::clusters::IAS_ACE {
                alarm_system::ias_ace::handle_ias_ace_indication(
                    ind,
                    frame,
                    alarms,
                    dev_table,
                    resources,
                    store.as_ref(),
                    wrapper,
                    bus,
                );
            }
        });
    }

    /// One cooperative scheduling round: fire timers, drain the bus, fan
    /// events into the alarm subsystem until no new work appears.
    pub fn advance(&mut self, now: SteadyTime) -> Vec<Event> {
        self.alarms.advance(now, &mut self.core.bus);

        let mut processed = Vec::new();
        let mut batch = self.core.advance(now);

        // alarm handlers may enqueue follow-up events; a few rounds settle
        for _ in 0..8 {
            if batch.is_empty() {
                break;
            }

            for event in &batch {
                handle_alarm_system_event(
                    event,
                    &mut self.alarms,
                    &self.dev_table,
                    &mut self.core.resources,
                    &mut self.core.bus,
                    now,
                );
                handle_alarm_system_device_event(
                    event,
                    &self.dev_table,
                    &self.core.resources,
                    &mut self.core.bus,
                );

                if event.what() == gateway_core::resource::RSTATE_ARM_STATE {
                    self.push_panel_status_to_keypads(event.id());
                }
            }

            processed.extend(batch);
            batch = self.core.drain(now);
        }

        processed
    }

    /// Sends an IAS ACE Panel Status Changed command to every keypad of
    /// the partition whose arm state changed.
    fn push_panel_status_to_keypads(&mut self, id_string: &str) {
        use alarm_system::device_table::entry_flags;
        use gateway_core::uniqueid::parse_unique_id;
        use gateway_core::ApsSend;

        let Ok(id) = id_string.parse::<u32>() else {
            return;
        };
        let Some(system) = self.alarms.get(id) else {
            return;
        };

        let panel_status = system.ias_ace_panel_status();
        let seconds = system.seconds_remaining();

        for i in 0..self.dev_table.size() {
            let entry = self.dev_table.at(i);
            if !entry.is_valid()
                || u32::from(entry.alarm_system_id) != id
                || entry.flags & entry_flags::IAS_ACE == 0
            {
                continue;
            }

            let Some(parts) = parse_unique_id(entry.unique_id()) else {
                continue;
            };

            let seq = self.core.wrapper.next_zcl_sequence();
            let req = alarm_system::ias_ace::build_panel_status_changed(
                zigbee_aps::Address::ext(parts.ext_address),
                parts.endpoint,
                panel_status,
                seconds,
                seq,
            );

            if let Err(err) = self.core.wrapper.send(&req) {
                tracing::debug!("panel status push to {} failed: {err}", entry.unique_id());
            }
        }
    }
}

/// Application state shared across handlers
pub struct ApiState {
    pub gateway: Mutex<Gateway>,
    pub ws_tx: tokio::sync::broadcast::Sender<String>,
}

fn load_ddf_bundle(gateway: &mut Gateway, dir: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::info!("no DDF directory at {}", dir.display());
        return;
    };

    let mut count = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match std::fs::read_to_string(&path) {
            Ok(json) => match gateway.core.reload_ddf(&json) {
                Ok(()) => count += 1,
                Err(err) => tracing::warn!("DDF {} rejected: {err}", path.display()),
            },
            Err(err) => tracing::warn!("DDF {} unreadable: {err}", path.display()),
        }
    }

    tracing::info!("loaded {count} device description files");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "gateway_api=debug,gateway_core=debug,alarm_system=debug,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let data_dir = std::path::PathBuf::from(data_dir);

    let store = Arc::new(FileStore::open(data_dir.join("alarmsystems.json"))?);
    let mut gateway = Gateway::new(Arc::clone(&store));

    load_ddf_bundle(&mut gateway, &data_dir.join("ddf"));

    // hydrate alarm state; id 1 always exists
    alarm_system::device_table::load_device_table(&mut gateway.dev_table, store.as_ref());
    let now = steady_now();
    load_alarm_systems(&mut gateway.alarms, store.as_ref(), &mut gateway.core.bus, now);
    init_default_alarm_system(&mut gateway.alarms, store.as_ref(), &mut gateway.core.bus, now);

    let (ws_tx, _) = tokio::sync::broadcast::channel(64);

    let state = Arc::new(ApiState { gateway: Mutex::new(gateway), ws_tx });

    // indication ingress; the coprocessor driver feeds this channel
    let (ind_tx, mut ind_rx) =
        tokio::sync::mpsc::channel::<zigbee_aps::ApsDataIndication>(64);
    let _driver_ingress = ind_tx;
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(ind) = ind_rx.recv().await {
                if let Ok(mut gateway) = state.gateway.lock() {
                    gateway.handle_indication(&ind);
                }
            }
        });
    }

    // cooperative scheduling tick: timers, event bus, websocket push
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(250));
            loop {
                interval.tick().await;

                let messages = {
                    let Ok(mut gateway) = state.gateway.lock() else {
                        continue;
                    };
                    gateway.advance(steady_now());
                    websocket::collect_alarm_messages(&mut gateway.alarms)
                };

                for message in messages {
                    let _ = state.ws_tx.send(message);
                }
            }
        });
    }

    let app = Router::new()
        .route("/alarmsystems", get(alarmsystems::get_all))
        .route(
            "/alarmsystems/:id",
            get(alarmsystems::get_one).put(alarmsystems::put_attributes),
        )
        .route("/alarmsystems/:id/config", put(alarmsystems::put_config))
        .route("/alarmsystems/:id/disarm", put(alarmsystems::put_disarm))
        .route("/alarmsystems/:id/arm_stay", put(alarmsystems::put_arm_stay))
        .route("/alarmsystems/:id/arm_night", put(alarmsystems::put_arm_night))
        .route("/alarmsystems/:id/arm_away", put(alarmsystems::put_arm_away))
        .route(
            "/alarmsystems/:id/device/:uniqueid",
            put(alarmsystems::put_device).delete(alarmsystems::delete_device),
        )
        .route("/ws", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".to_string());
    tracing::info!("gateway API listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
