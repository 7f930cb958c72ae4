//! Transfer tagging side-table.
//!
//! Associates a value (by identity) with the ports that must be moved, not
//! copied, whenever that value is sent. Entries hold the value weakly: once
//! every handle to the value is dropped its registration is swept.

use crate::channel::Port;
use crate::value::Value;
use dashmap::DashMap;
use std::any::Any;
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

struct Registration {
    owner: Weak<dyn Any + Send + Sync>,
    ports: Vec<Port>,
}

impl Registration {
    fn is_live(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

/// Concurrent, weakly keyed map from values to their transferables.
#[derive(Default)]
pub struct TransferTable {
    entries: DashMap<usize, Registration>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table. Tags are keyed by value identity, so every
    /// codec consults this one table.
    pub fn global() -> &'static Arc<TransferTable> {
        static GLOBAL: OnceLock<Arc<TransferTable>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TransferTable::new()))
    }

    /// Associate `ports` with `value`, replacing any earlier association.
    ///
    /// Plain data and remote handles have no identity and cannot be tagged.
    pub fn mark(&self, value: &Value, ports: Vec<Port>) {
        let Some(identity) = value.identity() else {
            debug!(
                kind = value.type_name(),
                "Value has no identity, transfer tag ignored"
            );
            return;
        };
        self.sweep();
        self.entries.insert(
            identity.key,
            Registration {
                owner: identity.owner,
                ports,
            },
        );
    }

    /// Ports registered for each value, concatenated in argument order.
    pub fn resources_of<'a>(&self, values: impl IntoIterator<Item = &'a Value>) -> Vec<Port> {
        let mut ports = Vec::new();
        for value in values {
            let Some(identity) = value.identity() else {
                continue;
            };
            if let Some(entry) = self.entries.get(&identity.key) {
                if entry.is_live() {
                    ports.extend(entry.ports.iter().cloned());
                }
            }
        }
        ports
    }

    /// Number of registrations whose value is still alive.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.value().is_live()).count()
    }

    /// Drop registrations whose value is gone.
    pub fn sweep(&self) {
        self.entries.retain(|_, registration| registration.is_live());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::value::{Function, Object};

    #[test]
    fn test_mark_and_lookup_in_order() {
        let table = TransferTable::new();
        let (p1, p2) = MessageChannel::new();
        let (p3, _p4) = MessageChannel::new();
        let first = Value::Object(Object::new());
        let second = Value::Function(Function::sync("f", |_, _| Ok(Value::null())));
        table.mark(&first, vec![p1.clone(), p2.clone()]);
        table.mark(&second, vec![p3.clone()]);

        let untagged = Value::Object(Object::new());
        let ports = table.resources_of([&second, &untagged, &first]);
        assert_eq!(ports, vec![p3, p1, p2]);
    }

    #[test]
    fn test_mark_overwrites() {
        let table = TransferTable::new();
        let (p1, p2) = MessageChannel::new();
        let obj = Value::Object(Object::new());
        table.mark(&obj, vec![p1]);
        table.mark(&obj, vec![p2.clone()]);
        assert_eq!(table.resources_of([&obj]), vec![p2]);
    }

    #[test]
    fn test_clones_share_identity() {
        let table = TransferTable::new();
        let (p1, _p2) = MessageChannel::new();
        let obj = Object::new();
        table.mark(&Value::Object(obj.clone()), vec![p1.clone()]);
        assert_eq!(table.resources_of([&Value::Object(obj)]), vec![p1]);
    }

    #[test]
    fn test_plain_data_cannot_be_tagged() {
        let table = TransferTable::new();
        let (p1, _p2) = MessageChannel::new();
        let data = Value::from(5);
        table.mark(&data, vec![p1]);
        assert!(table.resources_of([&data]).is_empty());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_registration_does_not_keep_value_alive() {
        let table = TransferTable::new();
        let (p1, _p2) = MessageChannel::new();
        let obj = Object::new();
        table.mark(&Value::Object(obj.clone()), vec![p1]);
        assert_eq!(table.live_count(), 1);

        drop(obj);
        assert_eq!(table.live_count(), 0);
        table.sweep();
        assert!(table.entries.is_empty());
    }

    #[test]
    fn test_global_table_is_shared() {
        let (p1, _p2) = MessageChannel::new();
        let obj = Value::Object(Object::new());
        TransferTable::global().mark(&obj, vec![p1.clone()]);
        assert!(Arc::ptr_eq(TransferTable::global(), TransferTable::global()));
        assert_eq!(TransferTable::global().resources_of([&obj]), vec![p1]);
    }

    #[test]
    fn test_concurrent_marks() {
        let table = Arc::new(TransferTable::new());
        let objects: Vec<Object> = (0..8).map(|_| Object::new()).collect();
        let handles: Vec<_> = objects
            .iter()
            .cloned()
            .map(|obj| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let (port, _peer) = MessageChannel::new();
                    let value = Value::Object(obj);
                    table.mark(&value, vec![port]);
                    table.resources_of([&value]).len()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(table.live_count(), 8);
    }
}
