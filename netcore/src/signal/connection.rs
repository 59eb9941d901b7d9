use super::slot::SlotControl;
use std::sync::Arc;

/// A handle to a connected slot. Equality is by slot id. Disconnecting is
/// idempotent and irreversible — an `active=false` slot is never
/// reactivated.
#[derive(Clone)]
pub struct Connection {
    pub(crate) slot: Arc<dyn SlotControl>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    pub fn connected(&self) -> bool {
        self.slot.is_active()
    }

    pub fn blocked(&self) -> bool {
        self.slot.is_blocked()
    }

    /// Deactivates the slot. Safe to call more than once; subsequent calls
    /// are no-ops.
    pub fn disconnect(&self) {
        self.slot.set_active(false);
    }

    pub fn block(&self) {
        self.slot.set_blocked(true);
    }

    pub fn unblock(&self) {
        self.slot.set_blocked(false);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
impl Eq for Connection {}

/// Disconnects its wrapped `Connection` when dropped.
pub struct ScopedConnection(pub Connection);

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

impl From<Connection> for ScopedConnection {
    fn from(connection: Connection) -> Self {
        ScopedConnection(connection)
    }
}

/// Owns a list of connections and disconnects all of them when dropped.
#[derive(Default)]
pub struct ConnectionGuard {
    connections: Vec<Connection>,
}

impl ConnectionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, connection: Connection) -> &mut Self {
        self.connections.push(connection);
        self
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        for connection in &self.connections {
            connection.disconnect();
        }
    }
}

/// Temporarily blocks a connection for the lifetime of the guard, restoring
/// the prior `blocked` state on drop.
pub struct Blocker {
    connection: Connection,
    was_blocked: bool,
}

impl Blocker {
    pub fn new(connection: Connection) -> Self {
        let was_blocked = connection.blocked();
        connection.block();
        Blocker {
            connection,
            was_blocked,
        }
    }
}

impl Drop for Blocker {
    fn drop(&mut self) {
        if !self.was_blocked {
            self.connection.unblock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Priority, Signal};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn disconnect_is_idempotent() {
        let signal: Signal<()> = Signal::new();
        let conn = signal.connect(Priority::NORMAL, |_| {});
        assert!(conn.connected());
        conn.disconnect();
        conn.disconnect();
        assert!(!conn.connected());
    }

    #[test]
    fn scoped_connection_disconnects_on_drop() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        {
            let _scoped = ScopedConnection(signal.connect(Priority::NORMAL, move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }));
            signal.emit(());
        }
        signal.emit(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocker_restores_prior_state() {
        let signal: Signal<()> = Signal::new();
        let conn = signal.connect(Priority::NORMAL, |_| {});
        {
            let _b = Blocker::new(conn.clone());
            assert!(conn.blocked());
        }
        assert!(!conn.blocked());
    }
}
