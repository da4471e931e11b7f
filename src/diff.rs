use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::types::*;

/// Collect `(path, old, new)` for every leaf that differs between two JSON
/// trees. Keys only present in `previous` are not reported.
pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    prefix: &str,
    changes: &mut Vec<(String, Value, Value)>,
) {
    let (Value::Object(prev), Value::Object(curr)) = (previous, current) else {
        if previous != current {
            changes.push((prefix.to_string(), previous.clone(), current.clone()));
        }
        return;
    };

    let empty = Value::Object(Map::new());
    for (key, value) in curr {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match prev.get(key) {
            Some(old) => diff_json(old, value, &path, changes),
            None if value.is_object() => diff_json(&empty, value, &path, changes),
            None => changes.push((path, Value::Null, value.clone())),
        }
    }
}

/// Typed events for the fields consumers care about on one device.
fn device_events(old: &DeviceSnapshot, new: &DeviceSnapshot, events: &mut Vec<Event>) {
    let id = &new.id;
    if old.online != new.online {
        events.push(Event::OnlineChanged {
            device_id: id.clone(),
            online: new.online,
        });
    }
    if let Some(temp) = new.ambient_temperature
        && old.ambient_temperature != new.ambient_temperature
    {
        events.push(Event::AmbientTemperatureChanged {
            device_id: id.clone(),
            temp,
        });
    }
    if let Some(temp) = new.target_temperature
        && old.target_temperature != new.target_temperature
    {
        events.push(Event::TargetTemperatureChanged {
            device_id: id.clone(),
            temp,
        });
    }
    if old.powered_on != new.powered_on {
        events.push(Event::PowerChanged {
            device_id: id.clone(),
            on: new.powered_on,
        });
    }
    if let Some(mode) = new.mode
        && old.mode != new.mode
    {
        events.push(Event::ModeChanged {
            device_id: id.clone(),
            mode,
        });
    }
}

/// Compare two published aggregates. Carried-over snapshots are identical
/// to their predecessors and produce nothing.
pub(crate) fn diff_snapshots(
    previous: &BTreeMap<DeviceId, DeviceSnapshot>,
    current: &BTreeMap<DeviceId, DeviceSnapshot>,
) -> Vec<Event> {
    let mut events = Vec::new();
    for (id, snap) in current {
        match previous.get(id) {
            Some(old) => device_events(old, snap, &mut events),
            None => events.push(Event::DeviceDiscovered {
                device_id: id.clone(),
                name: snap.name.clone(),
            }),
        }
    }
    for id in previous.keys().filter(|id| !current.contains_key(*id)) {
        events.push(Event::DeviceRemoved {
            device_id: id.clone(),
        });
    }
    events
}
