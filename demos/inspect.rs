//! Attach to a debuggee and list its engines and root contexts.
//!
//! ```text
//! cargo run --example inspect -- tcp://127.0.0.1:3768
//! cargo run --example inspect -- socket:/tmp/app-debug.sock
//! ```
//!
//! Set `DEBUG_WIRE_CONFIG` to a JSON file to override manager settings, and
//! `RUST_LOG` to control log output.

use debug_wire::service::inspector::{InspectorClient, InspectorEvent, QueryResult};
use debug_wire::{
    ConnectionHooks, ConnectionManager, DebugConnection, ManagerConfig, ManagerEvent, ServiceStatus,
    Target,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Inspector {
    client: Option<InspectorClient>,
    events: Option<mpsc::UnboundedReceiver<InspectorEvent>>,
}

impl ConnectionHooks for Inspector {
    fn create_clients(&mut self, connection: &DebugConnection) {
        match InspectorClient::new(connection) {
            Ok((client, events)) => {
                self.client = Some(client);
                self.events = Some(events);
            }
            Err(err) => tracing::error!("Could not register inspector: {}", err),
        }
    }

    fn destroy_clients(&mut self) {
        self.client = None;
        self.events = None;
    }
}

fn load_config() -> Result<ManagerConfig, Box<dyn std::error::Error>> {
    match std::env::var("DEBUG_WIRE_CONFIG") {
        Ok(path) => Ok(ManagerConfig::from_json(&std::fs::read_to_string(path)?)?),
        Err(_) => Ok(ManagerConfig::default()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug_wire=info")),
        )
        .init();

    let target: Target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:3768".to_string())
        .parse()?;
    let config = load_config()?;

    let local = tokio::task::LocalSet::new();
    local.run_until(run(target, config)).await
}

async fn run(target: Target, config: ManagerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut manager = ConnectionManager::with_hooks(config, Inspector::default());
    manager.connect(target.clone());

    match manager.next_event().await {
        Some(ManagerEvent::Opened) => tracing::info!("Attached to {}", target),
        other => return Err(format!("could not attach to {}: {:?}", target, other).into()),
    }

    let Some(mut events) = manager.hooks_mut().events.take() else {
        return Err("inspector not registered".into());
    };
    let Some(client) = manager.hooks().client.as_ref() else {
        return Err("inspector not registered".into());
    };
    if client.query_engines().is_none() {
        return Err("peer does not offer the inspector service".into());
    }

    let mut outstanding = 1;
    while outstanding > 0 {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            InspectorEvent::Result {
                result: QueryResult::Engines(engines),
                ..
            } => {
                outstanding -= 1;
                for engine in engines {
                    println!("engine {} ({})", engine.name, engine.debug_id);
                    if let Some(client) = manager.hooks().client.as_ref() {
                        if client.query_root_contexts(engine.debug_id).is_some() {
                            outstanding += 1;
                        }
                    }
                }
            }
            InspectorEvent::Result {
                result: QueryResult::RootContext(context),
                ..
            } => {
                outstanding -= 1;
                println!(
                    "  context {:?}: {} objects, {} child contexts",
                    context.name,
                    context.objects.len(),
                    context.contexts.len()
                );
                for object in &context.objects {
                    println!("    {} #{} {}", object.class_name, object.debug_id, object.id_string);
                }
            }
            InspectorEvent::StatusChanged(ServiceStatus::Enabled) => {}
            InspectorEvent::StatusChanged(status) => {
                return Err(format!("inspector became {:?}", status).into());
            }
            other => tracing::debug!("Ignoring {:?}", other),
        }
    }

    manager.disconnect();
    Ok(())
}
