use std::sync::Arc;

use opcua::server::prelude::*;
use opcua::sync::RwLock;

use crate::config::AdapterConfig;
use crate::db::{ConfigDb, TelemetryStore};
use crate::models::device::DeviceStatus;

const NAMESPACE: &str = "INSA Advanced IIoT Platform";
type SharedAddressSpace = Arc<RwLock<AddressSpace>>;

/// Builds and runs the OPC UA server: a `Devices` folder with one
/// sub-folder per device (Properties plus a `Telemetry` variable folder) and
/// a `SetStatus` method per device, kept current by a background task that
/// mirrors the latest reading of each known telemetry key into its variable
/// every five seconds so subscribing clients see updates without polling
/// `ConfigDb` themselves.
///
/// Unlike the other three adapters this one is a sink, not a source:
/// clients read and subscribe, they don't push telemetry in. `SetStatus` is
/// the one place this server mutates state, and it goes straight through
/// `ConfigDb::touch_device_status`, the same call the ingestion pipeline
/// uses for adapter-observed activity.
pub async fn run(cfg: &AdapterConfig, config_db: Arc<ConfigDb>, store: Arc<TelemetryStore>) -> anyhow::Result<()> {
    let ns_idx = 2u16;
    let endpoint_url = format!("opc.tcp://0.0.0.0:{}/{}/", cfg.opcua_bind_port, NAMESPACE);
    let server = ServerBuilder::new()
        .application_name("INSA IIoT Platform")
        .application_uri("urn:insa:iiot-platform")
        .discovery_urls(vec![endpoint_url.clone()])
        .endpoint("insa", ServerEndpoint::new_none(endpoint_url, &["anonymous".into()]))
        .server()
        .ok_or_else(|| anyhow::anyhow!("failed to build opc ua server"))?;

    let address_space = server.address_space();
    {
        let mut space = address_space.write();
        let devices_folder_id = space
            .add_folder("Devices", "Devices", &NodeId::objects_folder_id())
            .map_err(|_| anyhow::anyhow!("failed to create Devices folder"))?;
        for device in config_db.list_devices_any_tenant()? {
            build_device_node(&mut space, ns_idx, &devices_folder_id, config_db.clone(), &device);
        }
    }

    spawn_sync_task(config_db, store, address_space.clone(), ns_idx);

    tracing::info!("opcua adapter listening on port {}", cfg.opcua_bind_port);
    server.run();
    Ok(())
}

fn build_device_node(
    space: &mut AddressSpace,
    ns_idx: u16,
    parent: &NodeId,
    db: Arc<ConfigDb>,
    device: &crate::models::device::Device,
) {
    let device_id = device.id.as_str();
    let Ok(device_folder) = space.add_folder(device_id, device_id, parent) else { return };

    for (suffix, label, value) in [
        ("id", "id", device_id),
        ("type", "type", device.device_type.as_str()),
        ("protocol", "protocol", device.protocol.as_str()),
        ("status", "status", device.status.as_str()),
    ] {
        VariableBuilder::new(&NodeId::new(ns_idx, format!("{device_id}.{suffix}")), label, label)
            .value(value)
            .organized_by(&device_folder)
            .insert(space);
    }

    let _ = space.add_folder(format!("{device_id}.Telemetry"), "Telemetry", &device_folder);

    let tenant_id = device.tenant_id.clone();
    let device_id_owned = device.id.clone();
    MethodBuilder::new(&NodeId::new(ns_idx, format!("{device_id}.SetStatus")), "SetStatus", "SetStatus")
        .organized_by(&device_folder)
        .input_args(space, &[("Status", DataTypeId::String).into()])
        .output_args(space, &[("Result", DataTypeId::String).into()])
        .callback(Box::new(move |inputs, _context| {
            let requested = inputs.first().and_then(|v| match v {
                Variant::String(s) => s.value().clone(),
                _ => None,
            });
            let Some(requested) = requested else {
                return Ok(vec![Variant::from("error: Status argument required")]);
            };
            // Arbitrary strings are rejected; only the known status enum is
            // accepted.
            let Some(status) = validate_status(&requested) else {
                return Ok(vec![Variant::from(format!("error: unknown status {requested:?}"))]);
            };
            match db.update_device(&tenant_id, &device_id_owned, None, None, Some(status.as_str()), None) {
                Ok(true) => Ok(vec![Variant::from("ok")]),
                Ok(false) => Ok(vec![Variant::from("error: device not found")]),
                Err(e) => {
                    tracing::warn!("opcua SetStatus for {device_id_owned} failed: {e}");
                    Ok(vec![Variant::from("error: storage unavailable")])
                }
            }
        }))
        .insert(space);
}

fn spawn_sync_task(db: Arc<ConfigDb>, store: Arc<TelemetryStore>, space: SharedAddressSpace, ns_idx: u16) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            if let Err(e) = sync_tick(&db, &store, &space, ns_idx).await {
                tracing::warn!("opcua sync tick failed: {e}");
            }
        }
    });
}

async fn sync_tick(db: &ConfigDb, store: &TelemetryStore, space: &SharedAddressSpace, ns_idx: u16) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    for device in db.list_devices_any_tenant()? {
        for key in store.distinct_keys(&device.tenant_id, &device.id).await.unwrap_or_default() {
            if let Some(value) = store.latest_value(&device.tenant_id, &device.id, &key).await? {
                let node_id = NodeId::new(ns_idx, format!("{}.Telemetry.{key}", device.id));
                let mut space = space.write();
                let _ = space.set_variable_value(node_id, Variant::from(value), &now.into(), &now.into());
            }
        }
    }
    Ok(())
}

pub fn validate_status(s: &str) -> Option<DeviceStatus> {
    DeviceStatus::parse(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_status_string() {
        assert!(validate_status("banana").is_none());
        assert!(validate_status("offline").is_some());
    }
}
